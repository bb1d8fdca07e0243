//! Identifiers, results and events published by the supervisor

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

use devvisor_protocol::ErrorReport;

/// Identity of one spawned child; never reused within a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId(pub(crate) u64);

impl ChildId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a child ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopResult {
    /// Exit code, when the child exited normally
    pub code: Option<i32>,
    /// Terminating signal, when the child was signalled
    pub signal: Option<i32>,
    /// The child ignored the kill and was left behind
    pub abandoned: bool,
}

impl StopResult {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            signal: Some(signal),
            ..Self::default()
        }
    }

    pub(crate) fn abandoned() -> Self {
        Self {
            abandoned: true,
            ..Self::default()
        }
    }
}

impl From<ExitStatus> for StopResult {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            abandoned: false,
        }
    }
}

impl fmt::Display for StopResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal, self.abandoned) {
            (_, _, true) => write!(f, "abandoned"),
            (Some(code), _, _) => write!(f, "exit code {}", code),
            (None, Some(signal), _) => write!(f, "signal {}", signal),
            (None, None, _) => write!(f, "unknown status"),
        }
    }
}

/// Where the supervisor is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No child; rest state
    Stopped,
    /// A start-or-restart is in flight; further requests no-op
    Transitioning { stop_requested: bool },
    /// A child is alive
    Running,
    /// `stop()` is killing the child
    Stopping,
}

/// Result of [`crate::Link::start_or_restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new child was spawned
    Spawned(ChildId),
    /// Another transition was already in flight
    Coalesced,
    /// `stop()` arrived while the old child was being killed
    Stopped,
    /// The launcher failed; a respawn is scheduled
    SpawnFailed,
}

/// Readiness of a particular child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Alive, readiness not reported yet
    Starting,
    /// Reported `app_server_listening`
    Listening,
    /// Exited or replaced
    Gone,
}

/// Supervisor events
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Spawned { id: ChildId, pid: Option<u32> },
    ModuleImported { id: ChildId, path: PathBuf },
    Listening { id: ChildId },
    ChildError { id: ChildId, report: ErrorReport },
    Exited { id: ChildId, result: StopResult, expected: bool },
    SpawnFailed { error: String },
    Stdio { id: ChildId, stream: StdioStream, data: String },
}

/// Child output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioStream {
    Stdout,
    Stderr,
}

impl fmt::Display for StdioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioStream::Stdout => write!(f, "stdout"),
            StdioStream::Stderr => write!(f, "stderr"),
        }
    }
}
