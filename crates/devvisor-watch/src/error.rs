//! Error types for the watch coordinator

use thiserror::Error;

/// Boxed error returned by plugin hooks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Watch coordinator errors
#[derive(Debug, Error)]
pub enum WatchError {
    /// A watch or ignore pattern did not parse
    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// The filesystem watcher failed
    #[error("Watch backend error: {0}")]
    Backend(#[from] notify::Error),

    /// A plugin hook failed during a restart cycle
    #[error("Plugin '{plugin}' failed in {hook}: {source}")]
    Plugin {
        plugin: String,
        hook: &'static str,
        #[source]
        source: BoxError,
    },

    /// The coordinator was already started
    #[error("Watch coordinator already started")]
    AlreadyStarted,
}

/// Result type for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
