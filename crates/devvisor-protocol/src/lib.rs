//! # devvisor-protocol
//!
//! **Purpose**: Wire contract between the devvisor supervisor and the child
//! server it runs.
//!
//! ## Features
//!
//! - **Messages**: Closed set of `{ type, data }` envelopes in both directions
//! - **Codec**: Newline-delimited JSON; unknown or malformed lines are skipped
//! - **Terminal Geometry**: Column/row counts carried through the environment
//! - **Child Client**: Blocking client the child uses to report module loads,
//!   errors and readiness, and to receive terminal resizes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devvisor_protocol::ChildLink;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! if let Some(link) = ChildLink::from_env()? {
//!     link.install_panic_hook();
//!     link.module_imported("config/routes.toml")?;
//!     // ... bind the server socket ...
//!     link.server_listening()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod codec;
pub mod env;
pub mod error;
pub mod geometry;
pub mod message;

pub use child::{ChildLink, TerminalMode};
pub use codec::{decode_line, encode_line};
pub use error::{ProtocolError, Result};
pub use geometry::TerminalGeometry;
pub use message::{ChildMessage, ErrorReport, ModuleImported, ParentMessage, TtyResize};
