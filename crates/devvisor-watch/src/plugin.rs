//! Plugin hooks around restarts and file events

use async_trait::async_trait;
use devvisor_process::LinkOverrides;

use crate::{
    coordinator::WatchLens,
    error::BoxError,
    event::{RestartRequest, WatchEvent},
};

/// Allow/ignore globs for a plugin's own file listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerPatterns {
    pub allow: Vec<String>,
    pub ignore: Vec<String>,
}

impl ListenerPatterns {
    pub fn allow<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: patterns.into_iter().map(Into::into).collect(),
            ignore: Vec::new(),
        }
    }

    pub fn ignore<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// Extension point for code generators and other dev-time tooling
///
/// Hooks run sequentially in registration order. An error from a restart
/// hook aborts that restart cycle and is returned to whoever started it.
#[async_trait]
pub trait WatchPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Extra globs that restart the child
    fn watch_file_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Globs this plugin wants to hear about through `on_file_watcher_event`
    fn file_listener(&self) -> Option<ListenerPatterns> {
        None
    }

    /// May return option changes for the next child
    async fn on_before_watcher_start_or_restart(
        &self,
        _request: &RestartRequest,
    ) -> Result<Option<LinkOverrides>, BoxError> {
        Ok(None)
    }

    async fn on_before_watcher_restart(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs once the new child reports readiness
    async fn on_after_watcher_restart(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn on_file_watcher_event(
        &self,
        _event: &WatchEvent,
        _lens: &WatchLens,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}
