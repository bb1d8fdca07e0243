//! # devvisor-exit
//!
//! **Purpose**: Make sure teardown work finishes, or is abandoned on a
//! deadline, before the process exits
//!
//! Teardown callbacks run concurrently and independently under one time
//! limit. A failing callback does not cancel the others but turns a zero
//! exit code into 1.
//!
//! ```rust,no_run
//! use devvisor_exit::{ExitCoordinator, ExitOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let exit = ExitCoordinator::install(ExitOptions::default())?;
//! exit.on_before_exit(|| async {
//!     // flush, close, stop children...
//!     Ok(())
//! });
//! exit.exit(0).await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
mod signals;

pub use context::{ExitContext, ExitCoordinator, ExitOptions, ExitReport, Terminator, DEFAULT_EXIT_TIMEOUT};
pub use error::{BoxError, ExitError, Result};
