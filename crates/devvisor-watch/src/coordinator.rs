//! Restart coordination
//!
//! Turns filesystem events into restart cycles. A cycle holds the
//! in-progress flag and pauses event delivery from the first plugin hook
//! until the new child is ready (or gone), so a burst of saves produces one
//! restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use devvisor_process::{ChildId, ChildStatus, Link, LinkEvent, StartOutcome, StopResult};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{BackendEvent, WatchBackend},
    error::{BoxError, Result, WatchError},
    event::{DevEvent, RestartRequest, WatchEvent, WatchEventKind},
    matcher::PathMatcher,
    plugin::WatchPlugin,
};

const EVENT_CAPACITY: usize = 256;

/// What to watch
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Directories or files watched from the start
    pub roots: Vec<PathBuf>,
    /// Globs that restart the child; empty means every path under a root
    pub patterns: Vec<String>,
    /// Globs never acted on
    pub ignore: Vec<String>,
}

impl WatchOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
            ..Self::default()
        }
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore.push(pattern.into());
        self
    }
}

/// How [`WatchCoordinator::handle_event`] treated an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivery is paused
    Paused,
    /// No pattern or listener cares about the path
    Ignored,
    /// First addition event of a silently added path
    Suppressed,
    /// Only plugin listeners received it
    Forwarded,
    /// A restart cycle was started
    Restart,
    /// A restart cycle was already running
    Coalesced,
}

/// Result of one restart cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The new child reported readiness
    Ready(ChildId),
    /// Another restart was in progress
    Coalesced,
    /// The supervisor was stopped meanwhile
    Stopped,
    /// The child could not be spawned; the supervisor retries on its own
    SpawnFailed,
    /// The new child exited before becoming ready
    ChildExited(ChildId),
    /// The coordinator shut down while waiting
    ShutDown,
}

/// Drives restarts of a [`Link`] from file changes
#[derive(Clone)]
pub struct WatchCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    link: Link,
    backend: Mutex<Box<dyn WatchBackend>>,
    matcher: PathMatcher,
    plugins: Vec<PluginEntry>,
    silent: Mutex<SilentPaths>,
    pause_depth: AtomicUsize,
    restarting: AtomicBool,
    started: AtomicBool,
    /// Child whose readiness has been handled
    settled: Mutex<Option<ChildId>>,
    events: broadcast::Sender<DevEvent>,
    shutdown: CancellationToken,
}

struct PluginEntry {
    plugin: Arc<dyn WatchPlugin>,
    listener: Option<PathMatcher>,
}

#[derive(Default)]
struct SilentPaths {
    /// Added but no event seen yet
    pending: HashSet<PathBuf>,
    /// Added to the backend outside the roots
    watched: HashSet<PathBuf>,
}

/// Handle given to plugin listeners
#[derive(Clone)]
pub struct WatchLens {
    inner: Weak<CoordinatorInner>,
}

impl WatchLens {
    /// Start a restart cycle in the background
    ///
    /// Returns false if one is already running or the coordinator is gone.
    pub fn restart(&self, file: Option<PathBuf>) -> bool {
        match self.inner.upgrade() {
            Some(inner) => WatchCoordinator { inner }.spawn_restart(RestartRequest::plugin(file)),
            None => false,
        }
    }

    pub fn pause(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.resume();
        }
    }
}

impl std::fmt::Debug for WatchLens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchLens")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl WatchCoordinator {
    pub fn new(
        options: WatchOptions,
        link: Link,
        backend: Box<dyn WatchBackend>,
        plugins: Vec<Arc<dyn WatchPlugin>>,
    ) -> Result<Self> {
        let mut patterns = options.patterns.clone();
        for plugin in &plugins {
            patterns.extend(plugin.watch_file_patterns());
        }
        let matcher = PathMatcher::new(&options.roots, &patterns, &options.ignore)?;

        let plugins = plugins
            .into_iter()
            .map(|plugin| -> Result<PluginEntry> {
                let listener = match plugin.file_listener() {
                    Some(listener) => {
                        let mut ignore = listener.ignore;
                        ignore.extend(options.ignore.iter().cloned());
                        Some(PathMatcher::new(&options.roots, &listener.allow, &ignore)?)
                    }
                    None => None,
                };
                Ok(PluginEntry { plugin, listener })
            })
            .collect::<Result<Vec<_>>>()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                link,
                backend: Mutex::new(backend),
                matcher,
                plugins,
                silent: Mutex::new(SilentPaths::default()),
                pause_depth: AtomicUsize::new(0),
                restarting: AtomicBool::new(false),
                started: AtomicBool::new(false),
                settled: Mutex::new(None),
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Watch the roots and begin consuming backend and supervisor events
    ///
    /// Does not start the child; call [`WatchCoordinator::restart`] with
    /// [`RestartRequest::init`] for that.
    pub fn start(&self, backend_events: mpsc::UnboundedReceiver<BackendEvent>) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadyStarted);
        }

        {
            let mut backend = self.inner.lock_backend();
            for root in self.inner.matcher.roots() {
                backend.watch(root)?;
            }
        }
        info!(roots = ?self.inner.matcher.roots(), "Watching for changes");

        let link_events = self.inner.link.subscribe();
        tokio::spawn(event_loop(self.clone(), backend_events));
        tokio::spawn(link_pump(self.clone(), link_events));
        Ok(())
    }

    /// Decide what to do with one filesystem event
    ///
    /// A restart runs in the background; this returns once it is claimed.
    pub async fn handle_event(&self, event: WatchEvent) -> Disposition {
        let inner = &self.inner;
        if inner.is_paused() {
            trace!(path = %event.path.display(), "Watcher paused; dropping event");
            return Disposition::Paused;
        }

        if inner.take_pending(&event.path) && event.kind.is_addition() {
            debug!(path = %event.path.display(), "Suppressing first event of silently added path");
            return Disposition::Suppressed;
        }

        let forwarded = self.forward_to_plugins(&event).await;

        let relevant = inner.is_relevant(&event.path);
        if event.kind == WatchEventKind::Unlink {
            self.release_silently(&event.path);
        }
        if !relevant {
            return if forwarded {
                Disposition::Forwarded
            } else {
                Disposition::Ignored
            };
        }

        if self.spawn_restart(RestartRequest::from(&event)) {
            Disposition::Restart
        } else {
            Disposition::Coalesced
        }
    }

    /// Run a restart cycle and wait for it to finish
    pub async fn restart(&self, request: RestartRequest) -> Result<RestartOutcome> {
        match CycleGuard::claim(&self.inner) {
            Some(guard) => self.run_cycle(guard, request).await,
            None => {
                debug!(reason = %request.reason, "Restart already in progress");
                Ok(RestartOutcome::Coalesced)
            }
        }
    }

    /// Watch a path the child loaded, without treating it as new
    ///
    /// Ignored paths are skipped. Paths outside the roots are added to the
    /// backend, and their first addition event is swallowed. Returns whether
    /// the path was newly watched.
    pub fn add_silently(&self, path: &Path) -> Result<bool> {
        let inner = &self.inner;
        if inner.matcher.is_ignored(path) || inner.matcher.is_under_root(path) {
            return Ok(false);
        }
        if inner.lock_silent().watched.contains(path) {
            return Ok(false);
        }

        inner.lock_backend().watch(path)?;
        let mut silent = inner.lock_silent();
        silent.watched.insert(path.to_path_buf());
        silent.pending.insert(path.to_path_buf());
        debug!(path = %path.display(), "Silently watching imported module");
        Ok(true)
    }

    /// Stop watching a silently added path; returns whether it was watched
    ///
    /// The child reports the module again if a restart loads it.
    pub fn release_silently(&self, path: &Path) -> bool {
        let inner = &self.inner;
        {
            let mut silent = inner.lock_silent();
            if !silent.watched.remove(path) {
                return false;
            }
            silent.pending.remove(path);
        }
        if let Err(e) = inner.lock_backend().unwatch(path) {
            debug!(path = %path.display(), error = %e, "Failed to unwatch removed module");
        }
        debug!(path = %path.display(), "Released silently watched module");
        true
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn resume(&self) {
        self.inner.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.restarting.load(Ordering::SeqCst)
    }

    /// Subscribe to restart, readiness and output events
    pub fn subscribe(&self) -> broadcast::Receiver<DevEvent> {
        self.inner.events.subscribe()
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// Handle for plugin code running outside a listener
    pub fn lens(&self) -> WatchLens {
        WatchLens {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop consuming events and stop the child
    pub async fn shutdown(&self) -> Option<StopResult> {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down watch coordinator");
            self.inner.shutdown.cancel();
        }
        self.inner.link.stop().await
    }

    fn spawn_restart(&self, request: RestartRequest) -> bool {
        let Some(guard) = CycleGuard::claim(&self.inner) else {
            debug!(reason = %request.reason, "Restart already in progress; dropping request");
            return false;
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_cycle(guard, request).await {
                error!(error = %e, "Restart failed");
            }
        });
        true
    }

    async fn run_cycle(&self, guard: CycleGuard, request: RestartRequest) -> Result<RestartOutcome> {
        let inner = &self.inner;
        match &request.file {
            Some(file) => info!(reason = %request.reason, file = %file.display(), "Restarting"),
            None => info!(reason = %request.reason, "Starting"),
        }

        for entry in &inner.plugins {
            let overrides = entry
                .plugin
                .on_before_watcher_start_or_restart(&request)
                .await
                .map_err(|source| entry.error("on_before_watcher_start_or_restart", source))?;
            if let Some(overrides) = overrides {
                inner.link.apply_overrides(overrides);
            }
        }
        for entry in &inner.plugins {
            entry
                .plugin
                .on_before_watcher_restart()
                .await
                .map_err(|source| entry.error("on_before_watcher_restart", source))?;
        }

        inner.emit(DevEvent::Restart {
            file: request.file.clone(),
            reason: request.reason,
        });

        // Subscribe first so readiness of the new child cannot be missed
        let mut link_events = inner.link.subscribe();
        let id = match inner.link.start_or_restart().await {
            StartOutcome::Spawned(id) => id,
            StartOutcome::Coalesced => return Ok(RestartOutcome::Coalesced),
            StartOutcome::Stopped => return Ok(RestartOutcome::Stopped),
            StartOutcome::SpawnFailed => return Ok(RestartOutcome::SpawnFailed),
        };

        let ready = tokio::select! {
            _ = inner.shutdown.cancelled() => return Ok(RestartOutcome::ShutDown),
            ready = wait_until_ready(&inner.link, id, &mut link_events) => ready,
        };
        if !ready {
            debug!(child = %id, "Child exited before becoming ready");
            return Ok(RestartOutcome::ChildExited(id));
        }

        if inner.settle(id) {
            for entry in &inner.plugins {
                entry
                    .plugin
                    .on_after_watcher_restart()
                    .await
                    .map_err(|source| entry.error("on_after_watcher_restart", source))?;
            }
            inner.announce(id);
        }
        drop(guard);
        Ok(RestartOutcome::Ready(id))
    }

    async fn forward_to_plugins(&self, event: &WatchEvent) -> bool {
        let mut forwarded = false;
        let lens = self.lens();
        for entry in &self.inner.plugins {
            let Some(listener) = &entry.listener else {
                continue;
            };
            if !listener.matches(&event.path) {
                continue;
            }
            forwarded = true;
            if let Err(e) = entry.plugin.on_file_watcher_event(event, &lens).await {
                warn!(
                    plugin = %entry.plugin.name(),
                    path = %event.path.display(),
                    error = %e,
                    "Plugin file listener failed"
                );
            }
        }
        forwarded
    }

    /// After-restart hooks for a child that became ready outside a cycle
    async fn after_respawn(&self, id: ChildId) {
        if !self.inner.settle(id) {
            trace!(child = %id, "Readiness already handled");
            return;
        }
        for entry in &self.inner.plugins {
            if let Err(e) = entry.plugin.on_after_watcher_restart().await {
                warn!(plugin = %entry.plugin.name(), error = %e, "Plugin after-restart hook failed");
            }
        }
        self.inner.announce(id);
    }
}

impl std::fmt::Debug for WatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchCoordinator")
            .field("roots", &self.inner.matcher.roots())
            .field("plugins", &self.inner.plugins.len())
            .field("paused", &self.is_paused())
            .field("restarting", &self.is_restarting())
            .finish()
    }
}

impl PluginEntry {
    fn error(&self, hook: &'static str, source: BoxError) -> WatchError {
        WatchError::Plugin {
            plugin: self.plugin.name().to_string(),
            hook,
            source,
        }
    }
}

impl CoordinatorInner {
    fn lock_backend(&self) -> MutexGuard<'_, Box<dyn WatchBackend>> {
        self.backend.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_silent(&self) -> MutexGuard<'_, SilentPaths> {
        self.silent.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pause(&self) {
        self.pause_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        let _ = self
            .pause_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| depth.checked_sub(1));
    }

    fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::SeqCst) > 0
    }

    fn take_pending(&self, path: &Path) -> bool {
        self.lock_silent().pending.remove(path)
    }

    fn is_relevant(&self, path: &Path) -> bool {
        if self.matcher.is_ignored(path) {
            return false;
        }
        self.matcher.is_allowed(path) || self.lock_silent().watched.contains(path)
    }

    fn emit(&self, event: DevEvent) {
        let _ = self.events.send(event);
    }

    /// Claim the readiness of a child; true only for the first caller
    fn settle(&self, id: ChildId) -> bool {
        let mut settled = self.settled.lock().unwrap_or_else(|p| p.into_inner());
        if *settled == Some(id) {
            return false;
        }
        *settled = Some(id);
        true
    }

    fn announce(&self, id: ChildId) {
        info!(child = %id, "Server listening");
        self.emit(DevEvent::ServerListening);
    }
}

/// Holds the in-progress flag and one pause level for a restart cycle
struct CycleGuard {
    inner: Arc<CoordinatorInner>,
}

impl CycleGuard {
    fn claim(inner: &Arc<CoordinatorInner>) -> Option<Self> {
        inner
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        inner.pause();
        Some(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.inner.restarting.store(false, Ordering::SeqCst);
        self.inner.resume();

        // Readiness reported while the flag was held went unannounced
        let link = &self.inner.link;
        if let Some(id) = link.child_id() {
            if link.child_status(id) == ChildStatus::Listening && self.inner.settle(id) {
                self.inner.announce(id);
            }
        }
    }
}

async fn wait_until_ready(
    link: &Link,
    id: ChildId,
    events: &mut broadcast::Receiver<LinkEvent>,
) -> bool {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Listening { id: ready }) if ready == id => return true,
            Ok(LinkEvent::Exited { id: exited, .. }) if exited == id => return false,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Supervisor events lagged; checking child status");
                match link.child_status(id) {
                    ChildStatus::Listening => return true,
                    ChildStatus::Gone => return false,
                    ChildStatus::Starting => {}
                }
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

async fn event_loop(
    coordinator: WatchCoordinator,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
) {
    let shutdown = coordinator.inner.shutdown.clone();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(BackendEvent::Event(event)) => {
                let path = event.path.clone();
                let disposition = coordinator.handle_event(event).await;
                trace!(path = %path.display(), disposition = ?disposition, "Handled watch event");
            }
            Some(BackendEvent::Error(e)) => warn!(error = %e, "File watcher error"),
            None => {
                debug!("Watch backend closed");
                break;
            }
        }
    }
}

async fn link_pump(coordinator: WatchCoordinator, mut events: broadcast::Receiver<LinkEvent>) {
    let shutdown = coordinator.inner.shutdown.clone();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(LinkEvent::ModuleImported { path, .. }) => {
                if let Err(e) = coordinator.add_silently(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to watch imported module");
                }
            }
            Ok(LinkEvent::Listening { id }) => {
                if !coordinator.is_restarting() {
                    coordinator.after_respawn(id).await;
                }
            }
            Ok(LinkEvent::Stdio { stream, data, .. }) => {
                coordinator.inner.emit(DevEvent::RunnerStdio {
                    stdio: stream,
                    data,
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Supervisor events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RestartReason, WatchEventKind};
    use crate::mocks::RecordingBackend;
    use crate::plugin::ListenerPatterns;
    use async_trait::async_trait;
    use devvisor_process::mocks::MockLauncher;
    use devvisor_process::{LinkOptions, LinkOverrides, TerminalLink, RESIZE_DEBOUNCE};
    use std::time::Duration;

    struct Harness {
        coordinator: WatchCoordinator,
        launcher: MockLauncher,
        backend: RecordingBackend,
        backend_rx: Option<mpsc::UnboundedReceiver<BackendEvent>>,
        link_events: broadcast::Receiver<LinkEvent>,
        dev: broadcast::Receiver<DevEvent>,
    }

    fn harness(options: WatchOptions, plugins: Vec<Arc<dyn WatchPlugin>>) -> Harness {
        let launcher = MockLauncher::new();
        let link = Link::new(
            LinkOptions::new("server")
                .relay_stdio(false)
                .forward_terminal(false),
            Arc::new(launcher.clone()),
            TerminalLink::with_probe(Arc::new(|| None), RESIZE_DEBOUNCE),
        )
        .unwrap();
        let link_events = link.subscribe();
        let (backend, backend_rx) = RecordingBackend::new();
        let coordinator =
            WatchCoordinator::new(options, link, Box::new(backend.clone()), plugins).unwrap();
        let dev = coordinator.subscribe();
        Harness {
            coordinator,
            launcher,
            backend,
            backend_rx: Some(backend_rx),
            link_events,
            dev,
        }
    }

    fn change(path: &str) -> WatchEvent {
        WatchEvent::new(WatchEventKind::Change, path)
    }

    async fn next_spawn(rx: &mut broadcast::Receiver<LinkEvent>) -> ChildId {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let LinkEvent::Spawned { id, .. } = rx.recv().await.unwrap() {
                    return id;
                }
            }
        })
        .await
        .expect("no child spawned")
    }

    async fn next_dev(rx: &mut broadcast::Receiver<DevEvent>) -> DevEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no dev event")
            .unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[derive(Default)]
    struct RecordingPlugin {
        calls: Mutex<Vec<String>>,
        overrides: Option<LinkOverrides>,
        fail_in: Option<&'static str>,
        listener: Option<ListenerPatterns>,
    }

    impl RecordingPlugin {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> std::result::Result<(), BoxError> {
            let failing = self.fail_in.map_or(false, |hook| call.starts_with(hook));
            self.calls.lock().unwrap().push(call);
            if failing {
                return Err("hook failed".into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WatchPlugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        fn file_listener(&self) -> Option<ListenerPatterns> {
            self.listener.clone()
        }

        async fn on_before_watcher_start_or_restart(
            &self,
            request: &RestartRequest,
        ) -> std::result::Result<Option<LinkOverrides>, BoxError> {
            self.record(format!("before_start_or_restart:{}", request.reason))?;
            Ok(self.overrides.clone())
        }

        async fn on_before_watcher_restart(&self) -> std::result::Result<(), BoxError> {
            self.record("before_restart".to_string())
        }

        async fn on_after_watcher_restart(&self) -> std::result::Result<(), BoxError> {
            self.record("after_restart".to_string())
        }

        async fn on_file_watcher_event(
            &self,
            event: &WatchEvent,
            lens: &WatchLens,
        ) -> std::result::Result<(), BoxError> {
            self.record(format!("event:{}", event.path.display()))?;
            lens.restart(Some(event.path.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ignored_write_then_source_change() {
        let mut h = harness(
            WatchOptions::new("/proj").ignore("**/node_modules/**"),
            vec![],
        );

        let ignored = h
            .coordinator
            .handle_event(change("/proj/node_modules/react/index.js"))
            .await;
        assert_eq!(ignored, Disposition::Ignored);

        let restart = h.coordinator.handle_event(change("/proj/src/a.ts")).await;
        assert_eq!(restart, Disposition::Restart);

        next_spawn(&mut h.link_events).await;
        h.launcher.last_child().unwrap().listening();

        assert_eq!(
            next_dev(&mut h.dev).await,
            DevEvent::Restart {
                file: Some(PathBuf::from("/proj/src/a.ts")),
                reason: RestartReason::Change,
            }
        );
        assert_eq!(next_dev(&mut h.dev).await, DevEvent::ServerListening);

        let coordinator = h.coordinator.clone();
        eventually(move || !coordinator.is_restarting()).await;
        assert!(h.dev.try_recv().is_err());
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_silent_add_suppresses_first_addition() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);
        let shared = Path::new("/lib/shared.ts");

        assert!(h.coordinator.add_silently(shared).unwrap());
        assert!(h.backend.is_watching(shared));

        let first = h
            .coordinator
            .handle_event(WatchEvent::new(WatchEventKind::Add, shared))
            .await;
        assert_eq!(first, Disposition::Suppressed);
        assert_eq!(h.launcher.launch_count(), 0);

        let second = h.coordinator.handle_event(change("/lib/shared.ts")).await;
        assert_eq!(second, Disposition::Restart);
        next_spawn(&mut h.link_events).await;
    }

    #[tokio::test]
    async fn test_unlinked_module_is_released() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);
        let shared = Path::new("/lib/shared.ts");
        assert!(h.coordinator.add_silently(shared).unwrap());

        let removed = h
            .coordinator
            .handle_event(WatchEvent::new(WatchEventKind::Unlink, shared))
            .await;
        assert_eq!(removed, Disposition::Restart);
        assert!(!h.backend.is_watching(shared));
        next_spawn(&mut h.link_events).await;

        // Reported again by the new child
        assert!(h.coordinator.add_silently(shared).unwrap());
        assert!(h.backend.is_watching(shared));
        assert!(!h.coordinator.release_silently(Path::new("/lib/other.ts")));
    }

    #[tokio::test]
    async fn test_silent_add_skips_covered_and_ignored_paths() {
        let h = harness(
            WatchOptions::new("/proj").ignore("**/node_modules/**"),
            vec![],
        );

        assert!(!h.coordinator.add_silently(Path::new("/proj/src/a.ts")).unwrap());
        assert!(!h
            .coordinator
            .add_silently(Path::new("/proj/node_modules/x/index.js"))
            .unwrap());
        assert!(h.coordinator.add_silently(Path::new("/lib/a.js")).unwrap());
        assert!(!h.coordinator.add_silently(Path::new("/lib/a.js")).unwrap());
        assert_eq!(h.backend.watched(), vec![PathBuf::from("/lib/a.js")]);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);

        h.coordinator.pause();
        assert_eq!(
            h.coordinator.handle_event(change("/proj/a.ts")).await,
            Disposition::Paused
        );
        h.coordinator.resume();
        assert_eq!(
            h.coordinator.handle_event(change("/proj/a.ts")).await,
            Disposition::Restart
        );
        next_spawn(&mut h.link_events).await;
    }

    #[tokio::test]
    async fn test_events_during_cycle_are_dropped() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);

        assert_eq!(
            h.coordinator.handle_event(change("/proj/a.ts")).await,
            Disposition::Restart
        );
        next_spawn(&mut h.link_events).await;

        assert_eq!(
            h.coordinator.handle_event(change("/proj/b.ts")).await,
            Disposition::Paused
        );
        assert_eq!(
            h.coordinator.restart(RestartRequest::init()).await.unwrap(),
            RestartOutcome::Coalesced
        );

        h.launcher.last_child().unwrap().listening();
        let coordinator = h.coordinator.clone();
        eventually(move || !coordinator.is_restarting() && !coordinator.is_paused()).await;
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_plugin_hooks_run_in_order() {
        let plugin = Arc::new(RecordingPlugin {
            overrides: Some(LinkOverrides::default().env("SCHEMA_PATH", "/proj/schema.graphql")),
            ..RecordingPlugin::default()
        });
        let mut h = harness(
            WatchOptions::new("/proj"),
            vec![plugin.clone() as Arc<dyn WatchPlugin>],
        );

        let coordinator = h.coordinator.clone();
        let cycle = tokio::spawn(async move { coordinator.restart(RestartRequest::init()).await });
        next_spawn(&mut h.link_events).await;
        h.launcher.last_child().unwrap().listening();

        let outcome = cycle.await.unwrap().unwrap();
        assert!(matches!(outcome, RestartOutcome::Ready(_)));
        assert_eq!(
            plugin.calls(),
            vec!["before_start_or_restart:init", "before_restart", "after_restart"]
        );
        let spec = h.launcher.last_child().unwrap().spec().clone();
        assert_eq!(spec.env_value("SCHEMA_PATH"), Some("/proj/schema.graphql"));
    }

    #[tokio::test]
    async fn test_plugin_error_aborts_cycle() {
        let plugin = Arc::new(RecordingPlugin {
            fail_in: Some("before_restart"),
            ..RecordingPlugin::default()
        });
        let h = harness(WatchOptions::new("/proj"), vec![plugin as Arc<dyn WatchPlugin>]);

        let err = h
            .coordinator
            .restart(RestartRequest::init())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WatchError::Plugin {
                hook: "on_before_watcher_restart",
                ..
            }
        ));
        assert_eq!(h.launcher.launch_count(), 0);
        assert!(!h.coordinator.is_restarting());
        assert!(!h.coordinator.is_paused());
    }

    #[tokio::test]
    async fn test_child_exit_before_ready() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);

        let coordinator = h.coordinator.clone();
        let cycle = tokio::spawn(async move { coordinator.restart(RestartRequest::init()).await });
        let id = next_spawn(&mut h.link_events).await;
        h.launcher.last_child().unwrap().exit(1);

        assert_eq!(
            cycle.await.unwrap().unwrap(),
            RestartOutcome::ChildExited(id)
        );
        assert!(!h.coordinator.is_restarting());
    }

    #[tokio::test]
    async fn test_plugin_listener_can_restart() {
        let plugin = Arc::new(RecordingPlugin {
            listener: Some(ListenerPatterns::allow(["**/*.graphql"])),
            ..RecordingPlugin::default()
        });
        let mut h = harness(
            WatchOptions::new("/proj").pattern("src/**"),
            vec![plugin.clone() as Arc<dyn WatchPlugin>],
        );

        let disposition = h
            .coordinator
            .handle_event(change("/proj/schema.graphql"))
            .await;
        assert_eq!(disposition, Disposition::Forwarded);
        assert!(plugin
            .calls()
            .contains(&"event:/proj/schema.graphql".to_string()));

        next_spawn(&mut h.link_events).await;
        assert_eq!(
            next_dev(&mut h.dev).await,
            DevEvent::Restart {
                file: Some(PathBuf::from("/proj/schema.graphql")),
                reason: RestartReason::Plugin,
            }
        );

        assert_eq!(
            h.coordinator.handle_event(change("/proj/README.md")).await,
            Disposition::Paused
        );
    }

    #[tokio::test]
    async fn test_started_coordinator_follows_child() {
        let mut h = harness(WatchOptions::new("/proj"), vec![]);
        let rx = h.backend_rx.take().unwrap();
        h.coordinator.start(rx).unwrap();
        assert!(h.backend.is_watching(Path::new("/proj")));
        assert!(matches!(
            h.coordinator.start(mpsc::unbounded_channel().1),
            Err(WatchError::AlreadyStarted)
        ));

        h.backend.fail("inotify limit reached");
        h.backend.emit(change("/proj/src/a.ts"));
        next_spawn(&mut h.link_events).await;

        let child = h.launcher.last_child().unwrap();
        child.imported("/lib/util.js");
        child.write_stdout(b"booting\n").await;
        child.listening();

        let backend = h.backend.clone();
        eventually(move || backend.is_watching(Path::new("/lib/util.js"))).await;

        let mut saw_stdio = false;
        let mut saw_listening = false;
        while !(saw_stdio && saw_listening) {
            match next_dev(&mut h.dev).await {
                DevEvent::RunnerStdio { data, .. } => saw_stdio = data == "booting\n",
                DevEvent::ServerListening => saw_listening = true,
                DevEvent::Restart { .. } => {}
            }
        }

        // A crash respawn outside a cycle is announced by the pump
        let coordinator = h.coordinator.clone();
        eventually(move || !coordinator.is_restarting()).await;
        child.crash("TypeError: x is undefined", false);
        next_spawn(&mut h.link_events).await;
        h.launcher.last_child().unwrap().listening();
        loop {
            if next_dev(&mut h.dev).await == DevEvent::ServerListening {
                break;
            }
        }

        assert_eq!(h.coordinator.shutdown().await, Some(StopResult::signalled(9)));
        assert_eq!(h.launcher.live_count(), 0);
    }

    #[tokio::test]
    async fn test_started_coordinator_runs_after_hooks_once() {
        let plugin = Arc::new(RecordingPlugin::default());
        let mut h = harness(
            WatchOptions::new("/proj"),
            vec![plugin.clone() as Arc<dyn WatchPlugin>],
        );
        let rx = h.backend_rx.take().unwrap();
        h.coordinator.start(rx).unwrap();

        h.backend.emit(change("/proj/a.ts"));
        next_spawn(&mut h.link_events).await;
        let child = h.launcher.last_child().unwrap();
        child.listening();
        loop {
            if next_dev(&mut h.dev).await == DevEvent::ServerListening {
                break;
            }
        }
        let coordinator = h.coordinator.clone();
        eventually(move || !coordinator.is_restarting()).await;

        // The pump handles supervisor events in order, so output written
        // after readiness arrives only once Listening has been handled
        child.write_stdout(b"ready\n").await;
        loop {
            match next_dev(&mut h.dev).await {
                DevEvent::RunnerStdio { .. } => break,
                DevEvent::ServerListening => panic!("readiness announced twice"),
                DevEvent::Restart { .. } => {}
            }
        }

        let after_hooks = plugin
            .calls()
            .iter()
            .filter(|call| *call == "after_restart")
            .count();
        assert_eq!(after_hooks, 1);
        assert_eq!(h.launcher.launch_count(), 1);
    }
}
