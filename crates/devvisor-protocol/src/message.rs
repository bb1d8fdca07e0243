//! Message envelopes exchanged between parent and child
//!
//! Every message is an adjacently tagged object `{ "type": ..., "data": ... }`.
//! Child messages flow child → parent, parent messages flow parent → child.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Messages sent by the child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChildMessage {
    /// The child loaded a new source file
    ModuleImported(ModuleImported),
    /// The child hit an uncaught error
    Error(ErrorReport),
    /// The child's server accepts connections
    AppServerListening {},
}

/// Messages sent by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ParentMessage {
    /// The parent's terminal was resized
    TtyResize(TtyResize),
}

/// Payload of `module_imported`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleImported {
    pub file_path: PathBuf,
}

/// Payload of `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Error message
    pub error: String,
    /// Backtrace or stack, when the child captured one
    #[serde(default)]
    pub stack: Option<String>,
    /// The child is already going down on its own
    #[serde(default)]
    pub will_terminate: bool,
}

/// Payload of `tty_resize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtyResize {
    pub columns: u16,
    pub rows: u16,
}

impl ChildMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ChildMessage::ModuleImported(_) => "module_imported",
            ChildMessage::Error(_) => "error",
            ChildMessage::AppServerListening {} => "app_server_listening",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_imported_wire_shape() {
        let msg = ChildMessage::ModuleImported(ModuleImported {
            file_path: PathBuf::from("/proj/src/a.ts"),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "module_imported",
                "data": { "filePath": "/proj/src/a.ts" }
            })
        );
    }

    #[test]
    fn test_error_defaults() {
        let msg: ChildMessage =
            serde_json::from_str(r#"{"type":"error","data":{"error":"boom"}}"#).unwrap();
        match msg {
            ChildMessage::Error(report) => {
                assert_eq!(report.error, "boom");
                assert_eq!(report.stack, None);
                assert!(!report.will_terminate);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_listening_has_empty_data() {
        let json = serde_json::to_string(&ChildMessage::AppServerListening {}).unwrap();
        assert_eq!(json, r#"{"type":"app_server_listening","data":{}}"#);
    }

    #[test]
    fn test_tty_resize_wire_shape() {
        let msg = ParentMessage::TtyResize(TtyResize {
            columns: 120,
            rows: 40,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"tty_resize","data":{"columns":120,"rows":40}}"#);
    }
}
