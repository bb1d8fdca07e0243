//! Supervisor configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProcessError, Result};

/// Default wait for a killed child to exit before it is abandoned
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause before retrying a failed spawn
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the supervised child
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Executable command
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Project root; the child's working directory
    pub working_dir: PathBuf,
    /// Environment variables added on top of the parent environment
    pub env: HashMap<String, String>,
    /// Seed the child with the parent's terminal size and forward resizes
    pub forward_terminal: bool,
    /// Copy child stdout/stderr to the parent's own stdio
    pub relay_stdio: bool,
    /// How long a killed child may take to exit
    pub kill_timeout: Duration,
    /// Pause before retrying after a spawn failure
    pub respawn_delay: Duration,
}

impl LinkOptions {
    /// Create new options for a command, rooted at the current directory
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
            forward_terminal: true,
            relay_stdio: true,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the project root
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enable/disable terminal forwarding
    pub fn forward_terminal(mut self, forward: bool) -> Self {
        self.forward_terminal = forward;
        self
    }

    /// Enable/disable stdio relay
    pub fn relay_stdio(mut self, relay: bool) -> Self {
        self.relay_stdio = relay;
        self
    }

    /// Set kill timeout
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Set respawn delay
    pub fn respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ProcessError::InvalidConfig("command must not be empty".to_string()));
        }
        if self.kill_timeout.is_zero() {
            return Err(ProcessError::InvalidConfig(
                "kill timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Option changes a plugin may apply before a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOverrides {
    /// Extra environment for the next child
    pub env: HashMap<String, String>,
}

impl LinkOverrides {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
    }

    pub(crate) fn apply(self, options: &mut LinkOptions) {
        options.env.extend(self.env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let options = LinkOptions::new("node").args(["server.js"]).working_dir("/proj");
        assert_eq!(options.args, vec!["server.js".to_string()]);
        assert_eq!(options.working_dir, PathBuf::from("/proj"));
        assert!(options.forward_terminal);
        assert_eq!(options.kill_timeout, DEFAULT_KILL_TIMEOUT);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_command_is_invalid() {
        assert!(matches!(
            LinkOptions::new("  ").validate(),
            Err(ProcessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrides_extend_env() {
        let mut options = LinkOptions::new("node").env("PORT", "3000");
        LinkOverrides::default()
            .env("SCHEMA_PATH", "/tmp/schema.graphql")
            .env("PORT", "4000")
            .apply(&mut options);

        assert_eq!(options.env.get("PORT").map(String::as_str), Some("4000"));
        assert_eq!(options.env.len(), 2);
    }
}
