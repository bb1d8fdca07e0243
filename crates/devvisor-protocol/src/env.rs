//! Environment variables set on the child at spawn time

/// Set to `1` whenever the child runs under the supervisor
pub const DEV_MODE: &str = "DEVVISOR_DEV";

/// `host:port` of the parent's IPC listener for this child
pub const IPC_ADDR: &str = "DEVVISOR_IPC_ADDR";

/// Parent terminal width at spawn time
pub const TTY_COLUMNS: &str = "DEVVISOR_TTY_COLUMNS";

/// Parent terminal height at spawn time
pub const TTY_ROWS: &str = "DEVVISOR_TTY_ROWS";
