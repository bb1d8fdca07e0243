//! Error types for the parent/child protocol

use std::io;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message could not be encoded or decoded
    #[error("Invalid protocol message: {0}")]
    Codec(#[from] serde_json::Error),

    /// Channel I/O failed
    #[error("Protocol channel failed: {0}")]
    Io(#[from] io::Error),

    /// An environment variable carried an unusable value
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
