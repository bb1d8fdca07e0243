//! Error types for exit coordination

use std::io;
use thiserror::Error;

/// Boxed error returned by teardown callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Exit coordination errors
#[derive(Debug, Error)]
pub enum ExitError {
    /// OS signal handlers could not be registered
    #[error("Failed to install signal handlers: {0}")]
    Signal(#[from] io::Error),

    /// The teardown time limit must be positive
    #[error("Exit timeout must be greater than 0")]
    InvalidTimeout,
}

/// Result type for exit operations
pub type Result<T> = std::result::Result<T, ExitError>;
