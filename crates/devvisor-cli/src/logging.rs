//! Log output for the supervisor itself
//!
//! Logs go to stderr so they never interleave with the child's stdout.

use tracing_subscriber::EnvFilter;

/// Filter directive for the chosen verbosity
pub fn level_directive<'a>(configured: &'a str, verbose: bool, quiet: bool) -> &'a str {
    if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        configured
    }
}

/// Build the filter; `RUST_LOG` wins when set
pub fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init(directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(directive))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
