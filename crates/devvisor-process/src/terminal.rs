//! Terminal forwarding
//!
//! Children run with piped stdio, so they cannot query a terminal themselves.
//! The parent serializes its own size into the spawn environment and, once a
//! child is registered, relays resizes as `tty_resize` messages. Bursts of
//! resize events are coalesced on the trailing edge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use devvisor_protocol::{ParentMessage, TerminalGeometry};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    error::{ProcessError, Result},
    events::ChildId,
};

/// Quiet period before a resize burst is forwarded
pub const RESIZE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Source of the parent's terminal size
pub type GeometryProbe = Arc<dyn Fn() -> Option<TerminalGeometry> + Send + Sync>;

/// Forwards the parent terminal's geometry to supervised children
#[derive(Clone)]
pub struct TerminalLink {
    inner: Arc<TerminalInner>,
}

struct TerminalInner {
    probe: GeometryProbe,
    debounce: Duration,
    listen_os: bool,
    children: Mutex<HashMap<ChildId, mpsc::UnboundedSender<ParentMessage>>>,
    resizes: OnceLock<mpsc::UnboundedSender<()>>,
}

impl TerminalLink {
    /// Link reading stdout's terminal size and listening for SIGWINCH
    pub fn new() -> Self {
        Self::build(Arc::new(stdout_geometry), RESIZE_DEBOUNCE, true)
    }

    /// Link with a custom size source and no OS resize listener
    ///
    /// Resizes are delivered through [`TerminalLink::notify_resize`].
    pub fn with_probe(probe: GeometryProbe, debounce: Duration) -> Self {
        Self::build(probe, debounce, false)
    }

    fn build(probe: GeometryProbe, debounce: Duration, listen_os: bool) -> Self {
        Self {
            inner: Arc::new(TerminalInner {
                probe,
                debounce,
                listen_os,
                children: Mutex::new(HashMap::new()),
                resizes: OnceLock::new(),
            }),
        }
    }

    /// Capture the current terminal size
    pub fn serialize(&self) -> Result<TerminalGeometry> {
        (self.inner.probe)().ok_or(ProcessError::NoTerminal)
    }

    /// Register a child to receive resize notifications
    ///
    /// The first registration installs the resize listener.
    pub fn forward(&self, id: ChildId, sender: mpsc::UnboundedSender<ParentMessage>) {
        self.install();
        self.inner.lock_children().insert(id, sender);
        trace!(child = %id, "Forwarding terminal resizes");
    }

    /// Stop forwarding to a child
    pub fn unforward(&self, id: ChildId) {
        if self.inner.lock_children().remove(&id).is_some() {
            trace!(child = %id, "Stopped forwarding terminal resizes");
        }
    }

    /// Record a resize of the parent terminal
    pub fn notify_resize(&self) {
        if let Some(tx) = self.inner.resizes.get() {
            let _ = tx.send(());
        }
    }

    /// Number of children currently receiving resizes
    pub fn forwarded_count(&self) -> usize {
        self.inner.lock_children().len()
    }

    fn install(&self) {
        self.inner.resizes.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(debounce_resizes(
                Arc::downgrade(&self.inner),
                rx,
                self.inner.debounce,
            ));
            if self.inner.listen_os {
                listen_for_resizes(tx.clone());
            }
            debug!("Terminal resize listener installed");
            tx
        });
    }
}

impl Default for TerminalLink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TerminalLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalLink")
            .field("debounce", &self.inner.debounce)
            .field("forwarded", &self.forwarded_count())
            .finish()
    }
}

impl TerminalInner {
    fn lock_children(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ChildId, mpsc::UnboundedSender<ParentMessage>>> {
        self.children.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn broadcast(&self) {
        let Some(geometry) = (self.probe)() else {
            debug!("Terminal resized but no geometry available");
            return;
        };
        let message = ParentMessage::TtyResize(geometry.into());
        let children = self.lock_children();
        for (id, sender) in children.iter() {
            if sender.send(message).is_err() {
                trace!(child = %id, "Child channel closed before resize");
            }
        }
        debug!(
            columns = geometry.columns,
            rows = geometry.rows,
            children = children.len(),
            "Forwarded terminal resize"
        );
    }
}

async fn debounce_resizes(
    inner: Weak<TerminalInner>,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        // Trailing edge: wait until no resize arrived for a full period
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.broadcast();
    }
}

#[cfg(unix)]
fn listen_for_resizes(tx: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::window_change()) {
        Ok(mut resized) => {
            tokio::spawn(async move {
                while resized.recv().await.is_some() {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => debug!(error = %e, "Cannot listen for terminal resizes"),
    }
}

#[cfg(not(unix))]
fn listen_for_resizes(_tx: mpsc::UnboundedSender<()>) {
    debug!("Terminal resize forwarding is not supported on this platform");
}

fn stdout_geometry() -> Option<TerminalGeometry> {
    term_size::dimensions_stdout().and_then(|(columns, rows)| {
        let columns = u16::try_from(columns).ok()?;
        let rows = u16::try_from(rows).ok()?;
        (columns > 0 && rows > 0).then(|| TerminalGeometry::new(columns, rows))
    })
}
