//! Filesystem watching and collector lifecycle.
//!
//! Every collected file's directory is watched, along with each ancestor of
//! that directory so that a directory being created or moved into place is
//! noticed too. Raw watcher events are reduced to [`FsEvent`]s and routed
//! through a [`WatchTable`] to the collector that owns the path.

use crate::config::{FileSettings, StartPosition};
use crate::pipeline::channel::{PipelineMessage, Sender};
use crate::source::collector::{spawn_collector, CollectorHandle, Notification};
use crate::storage::StateStore;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to create filesystem watcher: {0}")]
    Watcher(#[from] notify::Error),
}

/// A filesystem change, independent of the watcher backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    /// The path was renamed away.
    RenamedFrom(PathBuf),
    /// Something was renamed onto the path.
    RenamedTo(PathBuf),
}

/// Reduce a watcher event to the changes routing cares about.
pub fn translate(event: Event) -> Vec<FsEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FsEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FsEvent::RenamedFrom).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FsEvent::RenamedTo).collect()
        }
        // Backends that report both halves separately also send this summary
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    FsEvent::RenamedTo(path)
                } else {
                    FsEvent::RenamedFrom(path)
                }
            })
            .collect(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            paths.into_iter().map(FsEvent::Modified).collect()
        }
        EventKind::Access(_) => Vec::new(),
    }
}

/// What the monitor should do in response to one [`FsEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Forward a notification to the collector for this path.
    Notify(PathBuf, Notification),
    /// A different file was moved onto this path.
    Replace(PathBuf),
    /// A directory above these paths changed: re-check them and rebuild the watches.
    Rewatch(Vec<PathBuf>),
}

/// Which watched directory entries matter, and to which collected paths.
#[derive(Debug, Default, Clone)]
pub struct WatchTable {
    /// directory -> file name -> collected path
    files: HashMap<PathBuf, HashMap<OsString, PathBuf>>,
    /// directory -> child name -> collected paths beneath that child
    ancestors: HashMap<PathBuf, HashMap<OsString, Vec<PathBuf>>>,
}

impl WatchTable {
    pub fn build<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Self {
        let mut table = WatchTable::default();
        for path in paths {
            let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };
            table
                .files
                .entry(dir.to_path_buf())
                .or_default()
                .insert(name.to_os_string(), path.to_path_buf());
            table.add_ancestors(dir, path);

            // A symlinked directory is also affected by changes above its target
            if let Ok(resolved) = dir.canonicalize() {
                if resolved != dir {
                    table.add_ancestors(&resolved, path);
                }
            }
        }
        table
    }

    fn add_ancestors(&mut self, dir: &Path, path: &Path) {
        let mut child = dir;
        while let (Some(parent), Some(name)) = (child.parent(), child.file_name()) {
            let entry = self
                .ancestors
                .entry(parent.to_path_buf())
                .or_default()
                .entry(name.to_os_string())
                .or_default();
            if !entry.iter().any(|p| p == path) {
                entry.push(path.to_path_buf());
            }
            child = parent;
        }
    }

    /// Every directory that needs a watch.
    pub fn directories(&self) -> BTreeSet<PathBuf> {
        self.files.keys().chain(self.ancestors.keys()).cloned().collect()
    }

    fn lookup_file(&self, path: &Path) -> Option<&PathBuf> {
        self.files.get(path.parent()?)?.get(path.file_name()?)
    }

    fn lookup_ancestor(&self, path: &Path) -> Option<&Vec<PathBuf>> {
        self.ancestors.get(path.parent()?)?.get(path.file_name()?)
    }

    /// Decide what an event means for the collectors.
    pub fn route(&self, event: &FsEvent) -> Vec<Dispatch> {
        let path = match event {
            FsEvent::Created(p)
            | FsEvent::Modified(p)
            | FsEvent::Removed(p)
            | FsEvent::RenamedFrom(p)
            | FsEvent::RenamedTo(p) => p,
        };

        let mut dispatches = Vec::new();
        if let Some(collected) = self.lookup_file(path) {
            let collected = collected.clone();
            dispatches.push(match event {
                FsEvent::Created(_) => Dispatch::Notify(collected, Notification::Created),
                FsEvent::Modified(_) => Dispatch::Notify(collected, Notification::Modified),
                FsEvent::Removed(_) => Dispatch::Notify(collected, Notification::Deleted),
                FsEvent::RenamedFrom(_) => Dispatch::Notify(collected, Notification::Renamed),
                FsEvent::RenamedTo(_) => Dispatch::Replace(collected),
            });
        }

        if let Some(beneath) = self.lookup_ancestor(path) {
            if matches!(event, FsEvent::Created(_) | FsEvent::RenamedTo(_)) {
                dispatches.push(Dispatch::Rewatch(beneath.clone()));
            }
        }
        dispatches
    }
}

/// Control messages for a running monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Ask every collector to flush its multiline assembler.
    Flush,
    /// Stop watching, stop every collector and wait for them.
    Stop,
}

struct Tracked {
    handle: CollectorHandle,
    /// Sent deleted/renamed/replaced; the next file at this path needs a new collector.
    retired: bool,
}

/// Owns the watcher and every collector it has started.
pub struct DirectoryMonitor {
    files: HashMap<PathBuf, Arc<FileSettings>>,
    table: WatchTable,
    watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    collectors: HashMap<PathBuf, Tracked>,
    draining: Vec<CollectorHandle>,
    queue: Sender<PipelineMessage>,
    state: StateStore,
}

impl DirectoryMonitor {
    /// Start a collector per file (resuming from saved state) and set up the watches.
    pub fn start(
        files: Vec<FileSettings>,
        queue: Sender<PipelineMessage>,
        state: StateStore,
    ) -> Result<Self, MonitorError> {
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;

        let files: HashMap<PathBuf, Arc<FileSettings>> = files
            .into_iter()
            .map(|settings| (settings.path.clone(), Arc::new(settings)))
            .collect();

        let mut monitor = Self {
            table: WatchTable::default(),
            files,
            watcher,
            watched: Vec::new(),
            events,
            collectors: HashMap::new(),
            draining: Vec::new(),
            queue,
            state,
        };

        monitor.rewatch();

        let paths: Vec<PathBuf> = monitor.files.keys().cloned().collect();
        for path in paths {
            let start = match monitor.files.get(&path) {
                Some(settings) => monitor.state.resolve_start(&path, settings.start),
                None => continue,
            };
            monitor.spawn(&path, start);
        }
        Ok(monitor)
    }

    /// Process watcher events until `Stop`, then shut every collector down.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MonitorCommand>) {
        info!(files = self.files.len(), directories = self.watched.len(), "directory monitor started");
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Ok(event)) => {
                        for change in translate(event) {
                            self.apply(&change);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "watcher error"),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(MonitorCommand::Flush) => self.broadcast(Notification::Flush),
                    Some(MonitorCommand::Stop) | None => break,
                },
            }
        }
        self.stop_collectors().await;
    }

    fn apply(&mut self, change: &FsEvent) {
        for dispatch in self.table.route(change) {
            debug!(?change, ?dispatch, "routing");
            match dispatch {
                Dispatch::Notify(path, Notification::Created) if self.is_retired(&path) => {
                    info!(path = %path.display(), "file recreated, starting new collector");
                    self.respawn(&path);
                }
                Dispatch::Notify(path, notification) => {
                    let retires = matches!(notification, Notification::Deleted | Notification::Renamed);
                    self.notify(&path, notification);
                    if retires {
                        self.retire(&path);
                    }
                }
                Dispatch::Replace(path) => {
                    info!(path = %path.display(), "file replaced, starting new collector");
                    self.notify(&path, Notification::Replaced);
                    self.retire(&path);
                    self.respawn(&path);
                }
                Dispatch::Rewatch(paths) => {
                    for path in paths {
                        if self.is_retired(&path) {
                            if path.exists() {
                                self.respawn(&path);
                            }
                        } else {
                            self.notify(&path, Notification::Check);
                        }
                    }
                    self.rewatch();
                }
            }
        }
    }

    fn is_retired(&self, path: &Path) -> bool {
        self.collectors
            .get(path)
            .map_or(true, |tracked| tracked.retired || tracked.handle.is_finished())
    }

    fn notify(&self, path: &Path, notification: Notification) {
        if let Some(tracked) = self.collectors.get(path) {
            if !tracked.handle.notify(notification) {
                debug!(path = %path.display(), ?notification, "collector already exited");
            }
        }
    }

    fn broadcast(&self, notification: Notification) {
        for tracked in self.collectors.values() {
            tracked.handle.notify(notification);
        }
    }

    fn retire(&mut self, path: &Path) {
        if let Some(tracked) = self.collectors.get_mut(path) {
            tracked.retired = true;
        }
    }

    /// Start a fresh collector at offset 0, leaving any old one to drain.
    fn respawn(&mut self, path: &Path) {
        self.spawn(path, StartPosition::Offset(0));
    }

    fn spawn(&mut self, path: &Path, start: StartPosition) {
        let Some(settings) = self.files.get(path).cloned() else {
            return;
        };
        let handle = spawn_collector(settings, start, self.queue.clone(), Some(self.state.clone()));
        let previous = self.collectors.insert(
            path.to_path_buf(),
            Tracked {
                handle,
                retired: false,
            },
        );
        if let Some(previous) = previous {
            self.draining.push(previous.handle);
        }
        self.draining.retain(|handle| !handle.is_finished());
    }

    /// Drop every watch and set them up again from the current directory layout.
    fn rewatch(&mut self) {
        for dir in self.watched.drain(..) {
            let _ = self.watcher.unwatch(&dir);
        }

        self.table = WatchTable::build(self.files.keys().map(PathBuf::as_path));
        for dir in self.table.directories() {
            match self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => self.watched.push(dir),
                Err(e) => debug!(dir = %dir.display(), error = %e, "cannot watch directory yet"),
            }
        }
        debug!(watched = self.watched.len(), "watches set up");
    }

    async fn stop_collectors(&mut self) {
        for dir in self.watched.drain(..) {
            let _ = self.watcher.unwatch(&dir);
        }
        for (_, tracked) in self.collectors.drain() {
            tracked.handle.stop().await;
        }
        for handle in self.draining.drain(..) {
            handle.stop().await;
        }
        info!("directory monitor stopped");
    }
}

/// Create the command channel for a monitor.
pub fn monitor_commands() -> (
    mpsc::UnboundedSender<MonitorCommand>,
    mpsc::UnboundedReceiver<MonitorCommand>,
) {
    mpsc::unbounded_channel()
}
