//! # devvisor-process
//!
//! **Purpose**: Supervision of the single disposable child process behind a
//! dev server
//!
//! Owns at most one child at a time, restarts it on request or after a
//! recoverable crash, and stops it for good on shutdown.
//!
//! ## Features
//!
//! - **Coalesced Restarts**: A restart requested while another is in flight
//!   is dropped, never queued
//! - **Idempotent Stop**: Concurrent `stop()` calls share one kill
//! - **Crash Respawn**: Non-fatal child errors and broken IPC channels
//!   trigger a fresh child
//! - **Process Group Kill**: Children run in their own group on Unix
//! - **Terminal Forwarding**: Terminal size seeded through the environment,
//!   resizes relayed with a trailing-edge debounce
//! - **Event Bus**: Spawns, readiness, imports and exits on a broadcast
//!   channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devvisor_process::{CommandLauncher, Link, LinkOptions, TerminalLink};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = LinkOptions::new("node").args(["server.js"]);
//! let link = Link::new(options, Arc::new(CommandLauncher::new()), TerminalLink::new())?;
//!
//! link.start_or_restart().await;
//! // ... files change ...
//! link.start_or_restart().await;
//!
//! link.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod link;
pub mod mocks;
pub mod terminal;

pub use child::{ChildProcess, CommandChild};
pub use config::{LinkOptions, LinkOverrides, DEFAULT_KILL_TIMEOUT, DEFAULT_RESPAWN_DELAY};
pub use error::{ProcessError, Result};
pub use events::{ChildId, ChildStatus, LinkEvent, LinkState, StartOutcome, StdioStream, StopResult};
pub use launcher::{
    ChannelEvent, CommandLauncher, IpcChannel, IpcPeer, LaunchSpec, Launched, Launcher, OutputStream,
};
pub use link::Link;
pub use terminal::{GeometryProbe, TerminalLink, RESIZE_DEBOUNCE};
