//! Child process handles

use async_trait::async_trait;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::{
    error::{ProcessError, Result},
    events::StopResult,
};

/// A running OS process owned by the supervisor
#[async_trait]
pub trait ChildProcess: Send {
    /// Process ID, if the OS reported one
    fn id(&self) -> Option<u32>;

    /// Send a hard kill without waiting for the exit
    fn kill(&mut self) -> Result<()>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<StopResult>;
}

/// Wrapper around `tokio::process::Child` spawned in its own process group
pub struct CommandChild {
    /// Underlying tokio child process
    child: Child,
    /// Process ID
    pid: Option<u32>,
}

impl CommandChild {
    pub(crate) fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }
}

#[async_trait]
impl ChildProcess for CommandChild {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the child's whole process group
    ///
    /// - Unix: SIGKILL to the group via negative PID, falling back to the
    ///   process alone
    /// - Windows: `TerminateProcess` on the child
    fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    debug!(pid = %pid, "Sent SIGKILL to process group");
                    return Ok(());
                }
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to signal process group, killing process only");
                }
            }
        }

        self.child
            .start_kill()
            .map_err(|e| ProcessError::KillFailed(e.to_string()))
    }

    async fn wait(&mut self) -> Result<StopResult> {
        let status = self.child.wait().await?;
        Ok(status.into())
    }
}
