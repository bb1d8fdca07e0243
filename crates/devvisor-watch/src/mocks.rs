//! In-memory watch backend for tests and embedders that feed events
//! themselves

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{
    backend::{BackendEvent, WatchBackend},
    error::Result,
    event::WatchEvent,
};

/// Records watched paths; events are injected through [`RecordingBackend::emit`]
#[derive(Clone)]
pub struct RecordingBackend {
    watched: Arc<Mutex<Vec<PathBuf>>>,
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl RecordingBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                watched: Arc::new(Mutex::new(Vec::new())),
                tx,
            },
            rx,
        )
    }

    /// Deliver an event as if the filesystem produced it
    pub fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(BackendEvent::Event(event));
    }

    /// Deliver a watcher error
    pub fn fail(&self, error: &str) {
        let _ = self.tx.send(BackendEvent::Error(error.to_string()));
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched().iter().any(|p| p == path)
    }
}

impl WatchBackend for RecordingBackend {
    fn watch(&mut self, path: &Path) -> Result<()> {
        self.watched
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watched
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|p| p != path);
        Ok(())
    }
}
