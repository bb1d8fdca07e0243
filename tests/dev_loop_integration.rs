//! Integration: configuration, watch coordinator, supervisor and exit handling
//! working together on a scripted child

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devvisor_cli::runner::register_teardown;
use devvisor_cli::DevConfig;
use devvisor_exit::{ExitContext, ExitCoordinator, ExitOptions};
use devvisor_process::mocks::MockLauncher;
use devvisor_process::{Link, LinkEvent, StartOutcome, TerminalLink, RESIZE_DEBOUNCE};
use devvisor_watch::mocks::RecordingBackend;
use devvisor_watch::{
    DevEvent, RestartOutcome, RestartReason, RestartRequest, WatchCoordinator, WatchEvent,
    WatchEventKind,
};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

struct DevLoop {
    coordinator: WatchCoordinator,
    launcher: MockLauncher,
    backend: RecordingBackend,
    exit: ExitContext,
    exit_codes: Arc<Mutex<Vec<i32>>>,
}

fn project_config() -> DevConfig {
    let mut config = DevConfig::default();
    config.root = PathBuf::from("/proj");
    config.command = vec!["node".to_string(), "server.js".to_string()];
    config.link.forward_terminal = false;
    config.exit.timeout_ms = 100;
    config
}

fn dev_loop(config: &DevConfig) -> DevLoop {
    let launcher = MockLauncher::new();
    let link = Link::new(
        config.link_options().relay_stdio(false),
        Arc::new(launcher.clone()),
        TerminalLink::with_probe(Arc::new(|| None), RESIZE_DEBOUNCE),
    )
    .unwrap();
    let (backend, backend_rx) = RecordingBackend::new();
    let coordinator = WatchCoordinator::new(
        config.watch_options(),
        link,
        Box::new(backend.clone()),
        Vec::new(),
    )
    .unwrap();
    coordinator.start(backend_rx).unwrap();

    let exit_codes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exit_codes);
    let exit = ExitCoordinator::install(
        config
            .exit_options()
            .handle_signals(false)
            .terminator(move |code| sink.lock().unwrap().push(code)),
    )
    .unwrap();
    assert!(register_teardown(&exit, &coordinator));

    DevLoop {
        coordinator,
        launcher,
        backend,
        exit,
        exit_codes,
    }
}

async fn next_spawn(rx: &mut broadcast::Receiver<LinkEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let LinkEvent::Spawned { .. } = rx.recv().await.unwrap() {
                return;
            }
        }
    })
    .await
    .expect("no child spawned");
}

async fn next_dev(rx: &mut broadcast::Receiver<DevEvent>) -> DevEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no dev event")
        .unwrap()
}

/// Start, ignore a dependency write, restart on a source change, then exit
#[tokio::test]
async fn test_dev_loop_from_start_to_exit() {
    let config = project_config();
    let dev = dev_loop(&config);
    let mut spawned = dev.coordinator.link().subscribe();
    let mut events = dev.coordinator.subscribe();

    let starter = dev.coordinator.clone();
    let initial = tokio::spawn(async move { starter.restart(RestartRequest::init()).await });
    next_spawn(&mut spawned).await;
    let first = dev.launcher.last_child().unwrap();
    assert_eq!(first.spec().command, "node");
    first.listening();

    let outcome = assert_ok!(initial.await.unwrap());
    assert!(matches!(outcome, RestartOutcome::Ready(_)));
    assert_eq!(
        next_dev(&mut events).await,
        DevEvent::Restart {
            file: None,
            reason: RestartReason::Init
        }
    );
    assert_eq!(next_dev(&mut events).await, DevEvent::ServerListening);

    // Default ignore list keeps dependency churn quiet
    dev.backend.emit(WatchEvent::new(
        WatchEventKind::Change,
        "/proj/node_modules/react/index.js",
    ));
    dev.backend.emit(WatchEvent::new(WatchEventKind::Change, "/proj/src/a.ts"));

    assert_eq!(
        next_dev(&mut events).await,
        DevEvent::Restart {
            file: Some(PathBuf::from("/proj/src/a.ts")),
            reason: RestartReason::Change
        }
    );
    next_spawn(&mut spawned).await;
    assert!(!first.is_alive());
    dev.launcher.last_child().unwrap().listening();
    assert_eq!(next_dev(&mut events).await, DevEvent::ServerListening);
    assert_eq!(dev.launcher.launch_count(), 2);

    let report = dev.exit.exit(0).await;
    assert_eq!(report.code, 0);
    assert_eq!(report.completed, 1);
    assert_eq!(dev.launcher.live_count(), 0);
    assert_eq!(*dev.exit_codes.lock().unwrap(), vec![0]);
}

/// A child that ignores the kill cannot hold the exit past its deadline
#[tokio::test(start_paused = true)]
async fn test_stuck_child_does_not_block_exit() {
    let mut config = project_config();
    config.link.kill_timeout_ms = 60_000;
    let dev = dev_loop(&config);
    dev.launcher.ignore_kill(true);

    assert!(matches!(
        dev.coordinator.link().start_or_restart().await,
        StartOutcome::Spawned(_)
    ));

    let started = tokio::time::Instant::now();
    let report = dev.exit.exit(0).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.code, 0);
    assert_eq!(*dev.exit_codes.lock().unwrap(), vec![0]);
}

/// Configuration rejects a missing command before anything is spawned
#[test]
fn test_config_without_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cli = devvisor_cli::Cli {
        root: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let result = devvisor_cli::config::resolve(DevConfig::default(), dir.path(), &cli);
    assert_err!(result);
}
