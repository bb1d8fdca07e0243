//! Wires the supervisor together and keeps it running

use std::sync::Arc;

use devvisor_exit::{BoxError, ExitContext, ExitCoordinator};
use devvisor_process::{CommandLauncher, Link, TerminalLink};
use devvisor_watch::{DevEvent, NotifyBackend, RestartOutcome, RestartRequest, WatchCoordinator};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::config::DevConfig;

/// Run until a shutdown signal ends the process
pub async fn run(config: DevConfig) -> anyhow::Result<()> {
    let exit = ExitCoordinator::install(config.exit_options())?;

    let link = Link::new(
        config.link_options(),
        Arc::new(CommandLauncher::new()),
        TerminalLink::new(),
    )?;
    let (backend, backend_events) = NotifyBackend::new()?;
    let coordinator =
        WatchCoordinator::new(config.watch_options(), link, Box::new(backend), Vec::new())?;

    register_teardown(&exit, &coordinator);
    tokio::spawn(render_events(coordinator.subscribe()));
    coordinator.start(backend_events)?;

    info!(
        command = %config.command.join(" "),
        root = %config.root.display(),
        "Starting dev server"
    );
    match coordinator.restart(RestartRequest::init()).await {
        Ok(outcome) => log_outcome(outcome),
        Err(e) => error!(error = %e, "Initial start failed; waiting for changes"),
    }

    // The exit coordinator terminates the process
    std::future::pending::<()>().await;
    Ok(())
}

/// Stop the coordinator and its child during teardown
pub fn register_teardown(exit: &ExitContext, coordinator: &WatchCoordinator) -> bool {
    let coordinator = coordinator.clone();
    exit.on_before_exit(move || async move {
        match coordinator.shutdown().await {
            Some(result) => debug!(?result, "Dev server stopped"),
            None => debug!("Dev server was not running"),
        }
        Ok::<(), BoxError>(())
    })
}

/// Log each event until the coordinator goes away
pub async fn render_events(mut events: broadcast::Receiver<DevEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => render(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped dev events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(event: &DevEvent) {
    match event {
        DevEvent::Restart {
            file: Some(file),
            reason,
        } => info!(%reason, path = %file.display(), "Restarting"),
        DevEvent::Restart { file: None, reason } => info!(%reason, "Restarting"),
        DevEvent::ServerListening => info!("Server listening"),
        // Already relayed to our own stdio
        DevEvent::RunnerStdio { stdio, data } => trace!(%stdio, len = data.len(), "Child output"),
    }
}

fn log_outcome(outcome: RestartOutcome) {
    match outcome {
        RestartOutcome::Ready(id) => debug!(child = %id, "Dev server ready"),
        RestartOutcome::SpawnFailed => warn!("Dev server failed to start; retrying"),
        RestartOutcome::ChildExited(id) => {
            warn!(child = %id, "Dev server exited before it was ready; waiting for changes")
        }
        other => debug!(outcome = ?other, "Initial start finished"),
    }
}
