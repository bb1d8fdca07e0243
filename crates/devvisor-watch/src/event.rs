//! Filesystem events, restart requests and the observable event stream

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use devvisor_process::StdioStream;

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
}

impl WatchEventKind {
    /// Whether the event reports a new path
    pub fn is_addition(&self) -> bool {
        matches!(self, WatchEventKind::Add | WatchEventKind::AddDir)
    }
}

/// Metadata captured alongside an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

impl FileStats {
    /// Read metadata for a path, if it still exists
    pub fn read(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            is_dir: metadata.is_dir(),
        })
    }
}

/// One filesystem change delivered by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub stats: Option<FileStats>,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Option<FileStats>) -> Self {
        self.stats = stats;
        self
    }
}

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartReason {
    Change,
    Add,
    AddDir,
    Unlink,
    UnlinkDir,
    Plugin,
    Init,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::Change => "change",
            RestartReason::Add => "add",
            RestartReason::AddDir => "addDir",
            RestartReason::Unlink => "unlink",
            RestartReason::UnlinkDir => "unlinkDir",
            RestartReason::Plugin => "plugin",
            RestartReason::Init => "init",
        }
    }
}

impl From<WatchEventKind> for RestartReason {
    fn from(kind: WatchEventKind) -> Self {
        match kind {
            WatchEventKind::Add => RestartReason::Add,
            WatchEventKind::AddDir => RestartReason::AddDir,
            WatchEventKind::Change => RestartReason::Change,
            WatchEventKind::Unlink => RestartReason::Unlink,
            WatchEventKind::UnlinkDir => RestartReason::UnlinkDir,
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to start or restart the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub reason: RestartReason,
    pub file: Option<PathBuf>,
}

impl RestartRequest {
    /// The first start of a session
    pub fn init() -> Self {
        Self {
            reason: RestartReason::Init,
            file: None,
        }
    }

    /// A restart asked for by a plugin
    pub fn plugin(file: Option<PathBuf>) -> Self {
        Self {
            reason: RestartReason::Plugin,
            file,
        }
    }
}

impl From<&WatchEvent> for RestartRequest {
    fn from(event: &WatchEvent) -> Self {
        Self {
            reason: event.kind.into(),
            file: Some(event.path.clone()),
        }
    }
}

/// Events observable by the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevEvent {
    /// A restart cycle is about to replace the child
    Restart {
        file: Option<PathBuf>,
        reason: RestartReason,
    },
    /// The current child reported readiness
    ServerListening,
    /// Output from the child
    RunnerStdio { stdio: StdioStream, data: String },
}
