//! The supervisor ("link") owning the single child process
//!
//! State lives in a [`LinkState`] value behind a mutex that is never held
//! across an await. Each child gets three tasks: a reaper that owns the OS
//! handle and publishes the exit, a dispatcher for protocol messages, and
//! stdio pumps. A kill is a cancellation of the reaper's token followed by a
//! wait on the exit watch, so any number of callers can share one kill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use devvisor_protocol::{env, ChildMessage};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    child::ChildProcess,
    config::{LinkOptions, LinkOverrides},
    error::Result,
    events::{ChildId, ChildStatus, LinkEvent, LinkState, StartOutcome, StdioStream, StopResult},
    launcher::{ChannelEvent, LaunchSpec, Launched, Launcher, OutputStream},
    terminal::TerminalLink,
};

/// Capacity of the event bus
const EVENT_CAPACITY: usize = 1024;

type StopFuture = Shared<BoxFuture<'static, Option<StopResult>>>;

/// Supervisor for one disposable child process
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    options: RwLock<LinkOptions>,
    launcher: Arc<dyn Launcher>,
    terminal: TerminalLink,
    core: Mutex<LinkCore>,
    events: broadcast::Sender<LinkEvent>,
    respawn: mpsc::UnboundedSender<RespawnCause>,
    next_id: AtomicU64,
}

struct LinkCore {
    state: LinkState,
    child: Option<ChildSlot>,
    /// Present while the link is "stopped" by request
    stopping: Option<StopFuture>,
    listening: Option<ChildId>,
}

#[derive(Clone)]
struct ChildSlot {
    id: ChildId,
    pid: Option<u32>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<StopResult>>,
}

#[derive(Debug, Clone, Copy)]
enum RespawnCause {
    SpawnFailed,
    ChildError(ChildId),
}

impl Link {
    /// Create a supervisor; must be called from within a tokio runtime
    pub fn new(
        options: LinkOptions,
        launcher: Arc<dyn Launcher>,
        terminal: TerminalLink,
    ) -> Result<Self> {
        options.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (respawn, respawn_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(LinkInner {
            options: RwLock::new(options),
            launcher,
            terminal,
            core: Mutex::new(LinkCore {
                state: LinkState::Stopped,
                child: None,
                stopping: None,
                listening: None,
            }),
            events,
            respawn,
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(respawn_worker(Arc::downgrade(&inner), respawn_rx));
        Ok(Self { inner })
    }

    /// Start the child, or replace the running one
    ///
    /// Returns immediately with [`StartOutcome::Coalesced`] if another
    /// transition is in flight; requests are not queued.
    pub async fn start_or_restart(&self) -> StartOutcome {
        let (previous, pending_stop) = {
            let mut core = self.inner.lock_core();
            if matches!(core.state, LinkState::Transitioning { .. }) {
                debug!("Start or restart already in flight");
                return StartOutcome::Coalesced;
            }
            core.state = LinkState::Transitioning {
                stop_requested: false,
            };
            (core.child.clone(), core.stopping.take())
        };

        if let Some(stopping) = pending_stop {
            stopping.await;
        }
        if let Some(slot) = previous {
            debug!(child = %slot.id, "Killing previous child");
            slot.kill().await;
        }

        let mut core = self.inner.lock_core();
        if let LinkState::Transitioning {
            stop_requested: true,
        } = core.state
        {
            core.state = LinkState::Stopped;
            info!("Stop requested during restart; not spawning");
            return StartOutcome::Stopped;
        }

        match self.inner.spawn(&mut core) {
            Ok(id) => {
                core.state = LinkState::Running;
                StartOutcome::Spawned(id)
            }
            Err(e) => {
                core.state = LinkState::Stopped;
                drop(core);
                warn!(error = %e, "Failed to spawn child; retrying");
                self.inner.publish(LinkEvent::SpawnFailed {
                    error: e.to_string(),
                });
                let _ = self.inner.respawn.send(RespawnCause::SpawnFailed);
                StartOutcome::SpawnFailed
            }
        }
    }

    /// Kill the child and stay stopped
    ///
    /// Repeated calls share the first call's result and send no further kill
    /// signal. Resolves to `None` when there was no child.
    pub async fn stop(&self) -> Option<StopResult> {
        self.stop_future().await
    }

    fn stop_future(&self) -> StopFuture {
        let mut core = self.inner.lock_core();
        if let Some(stopping) = &core.stopping {
            return stopping.clone();
        }

        let target = core.child.clone();
        match &mut core.state {
            LinkState::Transitioning { stop_requested } => *stop_requested = true,
            state => {
                *state = if target.is_some() {
                    LinkState::Stopping
                } else {
                    LinkState::Stopped
                }
            }
        }

        if let Some(slot) = &target {
            info!(child = %slot.id, pid = ?slot.pid, "Stopping child");
            slot.kill.cancel();
        }

        let future = async move {
            match target {
                Some(slot) => Some(slot.kill().await),
                None => None,
            }
        }
        .boxed()
        .shared();
        core.stopping = Some(future.clone());
        future
    }

    /// Merge plugin-supplied option changes into the next spawn
    pub fn apply_overrides(&self, overrides: LinkOverrides) {
        if overrides.is_empty() {
            return;
        }
        debug!(env = ?overrides.env.keys().collect::<Vec<_>>(), "Applying link overrides");
        let mut options = self.inner.options.write().unwrap_or_else(|p| p.into_inner());
        overrides.apply(&mut options);
    }

    /// Snapshot of the current options
    pub fn options(&self) -> LinkOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.inner.lock_core().state
    }

    /// Identity of the attached child, if any
    pub fn child_id(&self) -> Option<ChildId> {
        self.inner.lock_core().child.as_ref().map(|c| c.id)
    }

    /// OS process ID of the attached child, if any
    pub fn child_pid(&self) -> Option<u32> {
        self.inner.lock_core().child.as_ref().and_then(|c| c.pid)
    }

    /// Readiness of a specific child
    pub fn child_status(&self, id: ChildId) -> ChildStatus {
        let core = self.inner.lock_core();
        match &core.child {
            Some(slot) if slot.id == id && core.listening == Some(id) => ChildStatus::Listening,
            Some(slot) if slot.id == id => ChildStatus::Starting,
            _ => ChildStatus::Gone,
        }
    }

    /// Subscribe to supervisor events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Terminal forwarder used for this supervisor's children
    pub fn terminal(&self) -> &TerminalLink {
        &self.inner.terminal
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.state())
            .field("child", &self.child_id())
            .finish()
    }
}

impl ChildSlot {
    /// Kill (idempotent) and wait for the exit
    async fn kill(mut self) -> StopResult {
        self.kill.cancel();
        let exited = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|result| *result);
        match exited {
            Ok(Some(result)) => result,
            _ => (*self.exit.borrow()).unwrap_or_default(),
        }
    }
}

impl LinkInner {
    fn lock_core(&self) -> MutexGuard<'_, LinkCore> {
        self.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn spawn(self: &Arc<Self>, core: &mut LinkCore) -> Result<ChildId> {
        assert!(
            core.child.is_none(),
            "spawn called while a child is still attached"
        );

        let options = self
            .options
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let id = ChildId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut env_vars: Vec<(String, String)> = vec![(env::DEV_MODE.to_string(), "1".to_string())];
        env_vars.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if options.forward_terminal {
            match self.terminal.serialize() {
                Ok(geometry) => {
                    env_vars.extend(geometry.to_env().into_iter().map(|(k, v)| (k.to_string(), v)))
                }
                Err(e) => debug!(error = %e, "Not forwarding terminal size"),
            }
        }

        let Launched {
            process,
            stdout,
            stderr,
            channel,
        } = self.launcher.launch(LaunchSpec {
            command: options.command.clone(),
            args: options.args.clone(),
            working_dir: options.working_dir.clone(),
            env: env_vars,
        })?;

        let pid = process.id();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        if options.forward_terminal {
            self.terminal.forward(id, channel.outbound.clone());
        }
        for (stream, output) in [(StdioStream::Stdout, stdout), (StdioStream::Stderr, stderr)] {
            if let Some(output) = output {
                tokio::spawn(pump_stdio(
                    Arc::clone(self),
                    id,
                    stream,
                    output,
                    options.relay_stdio,
                ));
            }
        }
        tokio::spawn(dispatch(Arc::clone(self), id, channel.inbound));
        tokio::spawn(reap(
            Arc::clone(self),
            id,
            process,
            kill.clone(),
            exit_tx,
            channel.task,
            options.kill_timeout,
        ));

        core.child = Some(ChildSlot {
            id,
            pid,
            kill,
            exit: exit_rx,
        });
        core.listening = None;

        info!(child = %id, pid = ?pid, command = %options.command, "Child spawned");
        self.publish(LinkEvent::Spawned { id, pid });
        Ok(id)
    }

    fn is_current(&self, id: ChildId) -> bool {
        let core = self.lock_core();
        core.stopping.is_none() && core.child.as_ref().map(|c| c.id) == Some(id)
    }

    fn mark_listening(&self, id: ChildId) -> bool {
        let mut core = self.lock_core();
        if core.child.as_ref().map(|c| c.id) == Some(id) {
            core.listening = Some(id);
            true
        } else {
            false
        }
    }

    fn detach(&self, id: ChildId) {
        let mut core = self.lock_core();
        if core.child.as_ref().map(|c| c.id) != Some(id) {
            return;
        }
        core.child = None;
        if core.listening == Some(id) {
            core.listening = None;
        }
        if matches!(core.state, LinkState::Running | LinkState::Stopping) {
            core.state = LinkState::Stopped;
        }
    }

    fn should_respawn(&self, cause: RespawnCause) -> bool {
        match cause {
            RespawnCause::SpawnFailed => {
                let core = self.lock_core();
                core.state == LinkState::Stopped && core.stopping.is_none() && core.child.is_none()
            }
            RespawnCause::ChildError(id) => self.is_current(id),
        }
    }
}

async fn respawn_worker(inner: Weak<LinkInner>, mut rx: mpsc::UnboundedReceiver<RespawnCause>) {
    while let Some(cause) = rx.recv().await {
        let delay = match inner.upgrade() {
            Some(inner) => match cause {
                RespawnCause::SpawnFailed => inner
                    .options
                    .read()
                    .map(|o| o.respawn_delay)
                    .unwrap_or(Duration::ZERO),
                RespawnCause::ChildError(_) => Duration::ZERO,
            },
            None => return,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.should_respawn(cause) {
            debug!(cause = ?cause, "Respawn no longer needed");
            continue;
        }
        let link = Link { inner };
        link.start_or_restart().await;
    }
}

async fn dispatch(
    inner: Arc<LinkInner>,
    id: ChildId,
    mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            ChannelEvent::Message(ChildMessage::ModuleImported(module)) => {
                debug!(child = %id, path = %module.file_path.display(), "Module imported");
                inner.publish(LinkEvent::ModuleImported {
                    id,
                    path: module.file_path,
                });
            }
            ChannelEvent::Message(ChildMessage::AppServerListening {}) => {
                if inner.mark_listening(id) {
                    info!(child = %id, "Child server listening");
                    inner.publish(LinkEvent::Listening { id });
                }
            }
            ChannelEvent::Message(ChildMessage::Error(report)) => {
                if report.will_terminate {
                    error!(child = %id, error = %report.error, "Child reported a fatal error and is exiting");
                } else {
                    warn!(child = %id, error = %report.error, "Child crashed; restarting");
                    if let Some(stack) = &report.stack {
                        debug!(child = %id, stack = %stack, "Child crash stack");
                    }
                    let _ = inner.respawn.send(RespawnCause::ChildError(id));
                }
                inner.publish(LinkEvent::ChildError { id, report });
            }
            ChannelEvent::Failed(reason) => {
                warn!(child = %id, reason = %reason, "Child IPC channel failed; restarting");
                let _ = inner.respawn.send(RespawnCause::ChildError(id));
            }
        }
    }
}

async fn reap(
    inner: Arc<LinkInner>,
    id: ChildId,
    mut process: Box<dyn ChildProcess>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<StopResult>>,
    channel_task: Option<AbortHandle>,
    kill_timeout: Duration,
) {
    let (status, expected) = tokio::select! {
        status = process.wait() => (status, false),
        _ = kill.cancelled() => {
            if let Err(e) = process.kill() {
                warn!(child = %id, error = %e, "Failed to send kill signal");
            }
            match tokio::time::timeout(kill_timeout, process.wait()).await {
                Ok(status) => (status, true),
                Err(_) => {
                    warn!(
                        child = %id,
                        timeout_ms = kill_timeout.as_millis() as u64,
                        "Child ignored kill; abandoning it"
                    );
                    (Ok(StopResult::abandoned()), true)
                }
            }
        }
    };

    let result = status.unwrap_or_else(|e| {
        warn!(child = %id, error = %e, "Failed to wait for child");
        StopResult::default()
    });

    if let Some(task) = channel_task {
        task.abort();
    }
    inner.terminal.unforward(id);
    inner.detach(id);
    let _ = exit_tx.send(Some(result));

    if expected {
        debug!(child = %id, result = %result, "Child stopped");
    } else {
        warn!(child = %id, result = %result, "Child exited; waiting for changes");
    }
    inner.publish(LinkEvent::Exited {
        id,
        result,
        expected,
    });
}

async fn pump_stdio(
    inner: Arc<LinkInner>,
    id: ChildId,
    stream: StdioStream,
    mut output: OutputStream,
    relay: bool,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match output.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(child = %id, stream = %stream, error = %e, "Child output closed");
                break;
            }
        };
        let chunk = &buf[..n];

        if relay {
            let written = match stream {
                StdioStream::Stdout => write_all_flush(tokio::io::stdout(), chunk).await,
                StdioStream::Stderr => write_all_flush(tokio::io::stderr(), chunk).await,
            };
            if let Err(e) = written {
                debug!(error = %e, "Failed to relay child output");
            }
        }

        inner.publish(LinkEvent::Stdio {
            id,
            stream,
            data: String::from_utf8_lossy(chunk).into_owned(),
        });
    }
}

async fn write_all_flush<W>(mut writer: W, chunk: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}
