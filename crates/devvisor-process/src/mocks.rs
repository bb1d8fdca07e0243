//! Mock launcher for testing and headless usage
//!
//! [`MockLauncher`] records every launch and hands out [`MockChild`]
//! handles that let a test act as the child: send protocol messages, write
//! output, exit, or ignore kills.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use devvisor_protocol::{ChildMessage, ErrorReport, ModuleImported, ParentMessage};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::{
    child::ChildProcess,
    error::{ProcessError, Result},
    events::StopResult,
    launcher::{ChannelEvent, IpcChannel, LaunchSpec, Launched, Launcher, OutputStream},
};

const SIGKILL: i32 = 9;

/// Launcher producing in-memory children
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    children: Vec<MockChild>,
    failures_pending: usize,
    ignore_kill: bool,
    next_pid: u32,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` launches fail
    pub fn fail_next_launches(&self, count: usize) {
        self.lock().failures_pending = count;
    }

    /// Children launched from now on ignore kill signals
    pub fn ignore_kill(&self, ignore: bool) {
        self.lock().ignore_kill = ignore;
    }

    /// Number of successful launches
    pub fn launch_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Handles for every launched child, oldest first
    pub fn children(&self) -> Vec<MockChild> {
        self.lock().children.clone()
    }

    /// Handle for the most recent child
    pub fn last_child(&self) -> Option<MockChild> {
        self.lock().children.last().cloned()
    }

    /// Number of launched children that have not exited
    pub fn live_count(&self) -> usize {
        self.lock().children.iter().filter(|c| c.is_alive()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched> {
        let mut state = self.lock();
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("mock launch failure for {}", spec.command),
            )));
        }

        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;
        let (exit_tx, exit_rx) = watch::channel(None);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
        let (channel, peer) = IpcChannel::pair();

        let child = MockChild {
            pid,
            spec,
            shared: Arc::new(MockShared {
                exit: exit_tx,
                kills: AtomicUsize::new(0),
                ignore_kill: AtomicBool::new(state.ignore_kill),
                messages: peer.inbound,
                parent_messages: Mutex::new(peer.outbound),
                stdout: tokio::sync::Mutex::new(Some(stdout_writer)),
            }),
        };
        state.children.push(child.clone());

        Ok(Launched {
            process: Box::new(MockProcess {
                pid,
                shared: Arc::clone(&child.shared),
                exit: exit_rx,
            }),
            stdout: Some(Box::new(stdout_reader) as OutputStream),
            stderr: None,
            channel,
        })
    }
}

struct MockShared {
    exit: watch::Sender<Option<StopResult>>,
    kills: AtomicUsize,
    ignore_kill: AtomicBool,
    messages: mpsc::UnboundedSender<ChannelEvent>,
    parent_messages: Mutex<mpsc::UnboundedReceiver<ParentMessage>>,
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
}

impl MockShared {
    fn finish(&self, result: StopResult) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
    }
}

/// Test-side handle to a launched child
#[derive(Clone)]
pub struct MockChild {
    pid: u32,
    spec: LaunchSpec,
    shared: Arc<MockShared>,
}

impl MockChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// What the supervisor asked to launch
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn is_alive(&self) -> bool {
        self.shared.exit.borrow().is_none()
    }

    /// Number of kill signals received
    pub fn kill_count(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Send a protocol message as the child
    pub fn send(&self, message: ChildMessage) {
        let _ = self.shared.messages.send(ChannelEvent::Message(message));
    }

    /// Report readiness
    pub fn listening(&self) {
        self.send(ChildMessage::AppServerListening {});
    }

    /// Report a loaded module
    pub fn imported(&self, path: impl Into<std::path::PathBuf>) {
        self.send(ChildMessage::ModuleImported(ModuleImported {
            file_path: path.into(),
        }));
    }

    /// Report an uncaught error
    pub fn crash(&self, error: &str, will_terminate: bool) {
        self.send(ChildMessage::Error(ErrorReport {
            error: error.to_string(),
            stack: None,
            will_terminate,
        }));
    }

    /// Break the message channel
    pub fn fail_channel(&self, reason: &str) {
        let _ = self
            .shared
            .messages
            .send(ChannelEvent::Failed(reason.to_string()));
    }

    /// Exit on its own with a code
    pub fn exit(&self, code: i32) {
        self.shared.finish(StopResult::exited(code));
    }

    /// Write to the child's stdout
    pub async fn write_stdout(&self, data: &[u8]) {
        let mut stdout = self.shared.stdout.lock().await;
        if let Some(writer) = stdout.as_mut() {
            let _ = writer.write_all(data).await;
        }
    }

    /// Messages the parent sent so far
    pub fn parent_messages(&self) -> Vec<ParentMessage> {
        let mut rx = self
            .shared
            .parent_messages
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }
}

impl std::fmt::Debug for MockChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChild")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("kills", &self.kill_count())
            .finish()
    }
}

struct MockProcess {
    pid: u32,
    shared: Arc<MockShared>,
    exit: watch::Receiver<Option<StopResult>>,
}

#[async_trait]
impl ChildProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self) -> Result<()> {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        if !self.shared.ignore_kill.load(Ordering::SeqCst) {
            self.shared.finish(StopResult::signalled(SIGKILL));
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<StopResult> {
        let result = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|result| *result);
        match result {
            Ok(Some(result)) => {
                // Close stdout like a real process would
                self.shared.stdout.lock().await.take();
                Ok(result)
            }
            _ => Err(ProcessError::KillFailed("mock exit channel closed".to_string())),
        }
    }
}
