//! Error types for process supervision

use std::io;
use thiserror::Error;

/// Process supervision errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to spawn process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Failed to kill process
    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    /// Invalid configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// The parent has no terminal to forward
    #[error("No terminal attached to standard output")]
    NoTerminal,
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
