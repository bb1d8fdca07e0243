//! # devvisor-watch
//!
//! **Purpose**: Restart a supervised dev server when its sources change
//!
//! ## Features
//!
//! - **Glob Filtering**: Allow and ignore patterns matched against each root
//! - **Restart Coalescing**: One restart cycle at a time; events arriving
//!   during a cycle are dropped
//! - **Silent Watching**: Modules reported by the child are watched without
//!   counting as new files
//! - **Plugin Hooks**: Before/after restart hooks and per-plugin file
//!   listeners
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devvisor_process::{CommandLauncher, Link, LinkOptions, TerminalLink};
//! use devvisor_watch::{NotifyBackend, RestartRequest, WatchCoordinator, WatchOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let link = Link::new(
//!     LinkOptions::new("node").args(["server.js"]),
//!     Arc::new(CommandLauncher::new()),
//!     TerminalLink::new(),
//! )?;
//! let (backend, events) = NotifyBackend::new()?;
//! let coordinator = WatchCoordinator::new(
//!     WatchOptions::new(".").ignore("**/node_modules/**"),
//!     link,
//!     Box::new(backend),
//!     vec![],
//! )?;
//!
//! coordinator.start(events)?;
//! coordinator.restart(RestartRequest::init()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod matcher;
pub mod mocks;
pub mod plugin;

pub use backend::{BackendEvent, NotifyBackend, WatchBackend};
pub use coordinator::{Disposition, RestartOutcome, WatchCoordinator, WatchLens, WatchOptions};
pub use error::{BoxError, Result, WatchError};
pub use event::{DevEvent, FileStats, RestartReason, RestartRequest, WatchEvent, WatchEventKind};
pub use matcher::PathMatcher;
pub use plugin::{ListenerPatterns, WatchPlugin};
