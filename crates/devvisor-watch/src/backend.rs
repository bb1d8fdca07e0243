//! Filesystem watch backends

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    error::Result,
    event::{FileStats, WatchEvent, WatchEventKind},
};

/// Output of a backend
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Event(WatchEvent),
    /// Non-fatal watcher failure
    Error(String),
}

/// Something that can watch paths and report changes
///
/// Events are delivered on the channel handed out when the backend was
/// created.
pub trait WatchBackend: Send {
    fn watch(&mut self, path: &Path) -> Result<()>;
    fn unwatch(&mut self, path: &Path) -> Result<()>;
}

/// Backend using the platform's recommended `notify` watcher
///
/// Directories are watched recursively. A single file is watched through
/// its parent directory, so replacing the file (an editor's atomic save)
/// does not drop the watch; events for siblings are filtered out.
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
    scope: Arc<Mutex<WatchScope>>,
}

/// What the notify watches cover
#[derive(Debug, Default)]
struct WatchScope {
    trees: HashSet<PathBuf>,
    /// Parent directory -> files watched through it
    dirs: HashMap<PathBuf, FileDir>,
}

#[derive(Debug, Default)]
struct FileDir {
    files: HashSet<PathBuf>,
    /// Whether this backend holds a notify watch on the directory
    owned: bool,
}

impl WatchScope {
    fn covers(&self, path: &Path) -> bool {
        if self.trees.iter().any(|tree| path.starts_with(tree)) {
            return true;
        }
        path.parent()
            .and_then(|dir| self.dirs.get(dir))
            .map_or(false, |dir| dir.files.contains(path))
    }

    fn under_tree(&self, path: &Path) -> bool {
        self.trees.iter().any(|tree| path.starts_with(tree))
    }
}

impl NotifyBackend {
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<BackendEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = Arc::new(Mutex::new(WatchScope::default()));
        let filter = Arc::clone(&scope);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let scope = filter.lock().unwrap_or_else(|p| p.into_inner());
                    for translated in translate(&event) {
                        if scope.covers(&translated.path) {
                            let _ = tx.send(BackendEvent::Event(translated));
                        } else {
                            trace!(path = %translated.path.display(), "Outside watched files");
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(BackendEvent::Error(e.to_string()));
                }
            },
            notify::Config::default(),
        )?;
        Ok((Self { watcher, scope }, rx))
    }

    // Never held across a notify call: the watcher thread takes it too
    fn scope(&self) -> MutexGuard<'_, WatchScope> {
        self.scope.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn watch_file(&mut self, path: &Path) -> Result<()> {
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            self.watcher.watch(path, RecursiveMode::NonRecursive)?;
            return Ok(());
        };

        let needs_watch = {
            let scope = self.scope();
            !scope.dirs.get(&dir).map_or(false, |d| d.owned) && !scope.under_tree(&dir)
        };
        if needs_watch {
            self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        }

        let mut scope = self.scope();
        let entry = scope.dirs.entry(dir).or_default();
        entry.owned |= needs_watch;
        entry.files.insert(path.to_path_buf());
        debug!(path = %path.display(), "Watching file through its directory");
        Ok(())
    }

    fn unwatch_file(&mut self, path: &Path) -> Result<()> {
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let release = {
            let mut scope = self.scope();
            let Some(entry) = scope.dirs.get_mut(dir) else {
                return Ok(());
            };
            entry.files.remove(path);
            if entry.files.is_empty() {
                scope.dirs.remove(dir).map_or(false, |d| d.owned)
            } else {
                false
            }
        };
        if release {
            self.watcher.unwatch(dir)?;
            debug!(dir = %dir.display(), "Released directory watch");
        }
        Ok(())
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return self.watch_file(path);
        }
        self.watcher.watch(path, RecursiveMode::Recursive)?;
        self.scope().trees.insert(path.to_path_buf());
        debug!(path = %path.display(), "Watching directory");
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        let was_tree = self.scope().trees.remove(path);
        if !was_tree {
            return self.unwatch_file(path);
        }
        self.watcher.unwatch(path)?;
        debug!(path = %path.display(), "Stopped watching directory");
        Ok(())
    }
}

/// Map a notify event onto add/change/unlink events
pub fn translate(event: &notify::Event) -> Vec<WatchEvent> {
    let kinds: Vec<WatchEventKind> = match event.kind {
        EventKind::Create(CreateKind::Folder) => vec![WatchEventKind::AddDir],
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| {
                if p.is_dir() {
                    WatchEventKind::AddDir
                } else {
                    WatchEventKind::Add
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![WatchEventKind::Unlink],
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![WatchEventKind::Add],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            vec![WatchEventKind::Unlink, WatchEventKind::Add]
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                if p.exists() {
                    WatchEventKind::Add
                } else {
                    WatchEventKind::Unlink
                }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => vec![],
        EventKind::Modify(_) => vec![WatchEventKind::Change],
        EventKind::Remove(RemoveKind::Folder) => vec![WatchEventKind::UnlinkDir],
        EventKind::Remove(_) => vec![WatchEventKind::Unlink],
        EventKind::Access(_) | EventKind::Any | EventKind::Other => vec![],
    };

    if kinds.is_empty() {
        trace!(kind = ?event.kind, "Ignoring watcher event");
        return vec![];
    }

    event
        .paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            // One kind for all paths, or one per path
            let kind = *kinds.get(i).unwrap_or(&kinds[0]);
            let stats = match kind {
                WatchEventKind::Unlink | WatchEventKind::UnlinkDir => None,
                _ => FileStats::read(path),
            };
            WatchEvent::new(kind, path.clone()).with_stats(stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;
    use std::path::PathBuf;
    use std::time::Duration;

    fn kinds(event: notify::Event) -> Vec<(WatchEventKind, PathBuf)> {
        translate(&event)
            .into_iter()
            .map(|e| (e.kind, e.path))
            .collect()
    }

    #[test]
    fn test_translate_create_and_remove() {
        let created = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/proj/missing.ts"));
        assert_eq!(
            kinds(created),
            vec![(WatchEventKind::Add, PathBuf::from("/proj/missing.ts"))]
        );

        let removed = notify::Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/proj/src"));
        assert_eq!(
            kinds(removed),
            vec![(WatchEventKind::UnlinkDir, PathBuf::from("/proj/src"))]
        );
    }

    #[test]
    fn test_translate_modify() {
        let changed = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/proj/a.ts"));
        assert_eq!(kinds(changed)[0].0, WatchEventKind::Change);

        let chmod = notify::Event::new(EventKind::Modify(ModifyKind::Metadata(
            notify::event::MetadataKind::Permissions,
        )))
        .add_path(PathBuf::from("/proj/a.ts"));
        assert!(kinds(chmod).is_empty());
    }

    #[test]
    fn test_translate_rename_pair() {
        let renamed = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/proj/old.ts"))
            .add_path(PathBuf::from("/proj/new.ts"));
        assert_eq!(
            kinds(renamed),
            vec![
                (WatchEventKind::Unlink, PathBuf::from("/proj/old.ts")),
                (WatchEventKind::Add, PathBuf::from("/proj/new.ts")),
            ]
        );
    }

    #[test]
    fn test_translate_access_ignored() {
        let opened = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/proj/a.ts"));
        assert!(kinds(opened).is_empty());
    }

    #[tokio::test]
    async fn test_notify_reports_write() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (mut backend, mut rx) = NotifyBackend::new().unwrap();
        backend.watch(&root).unwrap();

        let file = root.join("a.ts");
        std::fs::write(&file, "export {}").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let BackendEvent::Event(event) = event {
                    if event.path == file {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen);
    }

    async fn next_event_for(
        rx: &mut mpsc::UnboundedReceiver<BackendEvent>,
        file: &Path,
    ) -> bool {
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let BackendEvent::Event(event) = event {
                    if event.path == file {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_file_watch_survives_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("config.json");
        std::fs::write(&file, "{}").unwrap();

        let (mut backend, mut rx) = NotifyBackend::new().unwrap();
        backend.watch(&file).unwrap();

        // Write a temp file then rename it over the original, replacing the inode
        let tmp = root.join(".config.json.swp");
        std::fs::write(&tmp, r#"{"a":1}"#).unwrap();
        std::fs::rename(&tmp, &file).unwrap();
        assert!(next_event_for(&mut rx, &file).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        while rx.try_recv().is_ok() {}

        std::fs::write(&file, r#"{"a":2}"#).unwrap();
        assert!(next_event_for(&mut rx, &file).await);
    }

    #[tokio::test]
    async fn test_file_watch_ignores_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("watched.ts");
        let sibling = root.join("other.ts");
        std::fs::write(&file, "").unwrap();

        let (mut backend, mut rx) = NotifyBackend::new().unwrap();
        backend.watch(&file).unwrap();
        std::fs::write(&sibling, "x").unwrap();
        std::fs::write(&file, "y").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            let mut paths = Vec::new();
            while let Some(BackendEvent::Event(event)) = rx.recv().await {
                let done = event.path == file;
                paths.push(event.path);
                if done {
                    break;
                }
            }
            paths
        })
        .await
        .unwrap();
        assert!(seen.contains(&file));
        assert!(!seen.contains(&sibling));

        backend.unwatch(&file).unwrap();
        assert!(backend.scope().dirs.is_empty());
    }
}
