//! Newline-delimited JSON framing
//!
//! One message per line. Decoding never fails hard: a line that is not a
//! known message is dropped so a newer or misbehaving peer cannot take the
//! channel down.

use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

use crate::error::Result;

/// Encode a message as a single line, including the trailing newline
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line, returning `None` for blank, malformed or unknown messages
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(e) => {
            trace!(error = %e, line = %line, "Ignoring unrecognized protocol line");
            None
        }
    }
}
