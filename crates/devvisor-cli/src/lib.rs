//! # devvisor-cli
//!
//! **Purpose**: The `devvisor` binary
//!
//! Loads layered configuration, installs logging and exit handling, and runs
//! the watch coordinator around the user's dev server.

pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod runner;

pub use args::Cli;
pub use self::config::{ConfigLoader, DevConfig};
pub use error::{ConfigError, Result};
