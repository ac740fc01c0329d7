//! Per-file watchers and the supervisor that owns them.
//!
//! The [`WatchSupervisor`] owns a single [`notify`] watcher and subscribes it
//! to each tracked file's parent directory, once per directory no matter how
//! many tracked files live there. Notifications are routed by full path to the
//! file's watcher: a [`Debouncer`] that coalesces write bursts and a capture
//! task that records the settled state through the [`CapturePipeline`].
//!
//! # Architecture
//!
//! The notify callback is kept lightweight: it filters the event, looks up the
//! route for each path it names, flips that file's state to
//! [`WatchState::Debouncing`] and hands the path to the debouncer with
//! `try_send`. Once the stability window passes without new notifications, the
//! debouncer emits the path to the capture task, which waits until size and
//! modification time stop moving for one poll interval, then captures.
//!
//! ```text
//! notify callback --route--> Debouncer --settled--> capture task --> ChangeStore
//!                                                        |
//!                                                        +--> broadcast<WatchEvent>
//! ```
//!
//! # State machine
//!
//! `Idle -> Watching -> Debouncing -> Captured -> Watching`, and any state
//! moves to `Stopped` when the watch is dropped. `Stopped` is terminal. A
//! notification that arrives during a capture leaves the file in `Debouncing`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use notify::{
    event::{CreateKind, ModifyKind},
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::capture::CapturePipeline;
use crate::config::Config;
use crate::types::{TrackedFile, WatchEvent};
use crate::utils::Debouncer;

/// Upper bound on size/mtime checks while waiting for a write to settle.
const MAX_SETTLE_CHECKS: u32 = 600;

/// Capacity of the channel between a file's debouncer and its capture task.
const SETTLED_CAPACITY: usize = 16;

/// Errors that can occur while starting watchers.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// A watcher already exists for the path.
    #[error("already watching {}", .0.display())]
    AlreadyWatching(PathBuf),

    /// The path has no parent directory or file name to watch.
    #[error("cannot watch {}: no parent directory", .0.display())]
    NoParentDirectory(PathBuf),
}

/// Lifecycle state of a single file's watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WatchState {
    Idle = 0,
    Watching = 1,
    Debouncing = 2,
    Captured = 3,
    Stopped = 4,
}

impl WatchState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Watching,
            2 => Self::Debouncing,
            3 => Self::Captured,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Atomic cell holding a [`WatchState`], shared with the notify callback.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(WatchState::Idle as u8))
    }

    fn get(&self) -> WatchState {
        WatchState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the watcher has already stopped.
    fn advance(&self, next: WatchState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != WatchState::Stopped as u8).then_some(next as u8)
            })
            .is_ok()
    }

    /// Moves from `from` to `to` only if the cell still holds `from`.
    fn transition(&self, from: WatchState, to: WatchState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stop(&self) {
        self.0.store(WatchState::Stopped as u8, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.get() == WatchState::Stopped
    }
}

/// Debounce settings for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Quiet period after the last notification before a burst is settled.
    pub stability_window: Duration,

    /// Interval between size/mtime checks once the burst is settled.
    pub poll_interval: Duration,
}

impl From<&Config> for WatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            stability_window: config.stability_window,
            poll_interval: config.poll_interval,
        }
    }
}

/// Where the notify callback delivers notifications for one file.
#[derive(Debug, Clone)]
struct Route {
    state: Arc<StateCell>,
    debouncer: Arc<Debouncer<PathBuf>>,
}

impl Route {
    fn notify(&self, path: &Path) {
        if !self.state.advance(WatchState::Debouncing) {
            return;
        }

        // Never block the notify thread; a dropped notification is re-armed by the next one
        if !self.debouncer.try_send(path.to_path_buf()) {
            warn!(path = %path.display(), "Failed to queue write notification");
        }
    }
}

type Routes = RwLock<HashMap<PathBuf, Route>>;

/// The live watch on one tracked file.
///
/// Dropping the handle stops the watch: unsettled notifications are discarded
/// and no new capture starts. A capture that is already running completes.
#[derive(Debug)]
struct WatcherHandle {
    file_path: PathBuf,
    route: Route,
}

impl WatcherHandle {
    /// Spawns the debouncer and capture task for `file_path`.
    fn spawn(
        file_path: PathBuf,
        config: WatchConfig,
        pipeline: CapturePipeline,
        events: broadcast::Sender<WatchEvent>,
    ) -> Self {
        let state = Arc::new(StateCell::new());
        let (settled_tx, settled_rx) = mpsc::channel(SETTLED_CAPACITY);
        let debouncer = Arc::new(Debouncer::new(config.stability_window, settled_tx));

        tokio::spawn(run_capture_loop(
            settled_rx,
            config.poll_interval,
            pipeline,
            events,
            Arc::clone(&state),
        ));

        state.advance(WatchState::Watching);

        Self {
            file_path,
            route: Route { state, debouncer },
        }
    }

    fn state(&self) -> WatchState {
        self.route.state.get()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.route.state.stop();
        self.route.debouncer.cancel();
        debug!(path = %self.file_path.display(), "Stopped watching file");
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(_))
    )
}

/// Filters a notify event and forwards writes to the watchers of the paths it names.
fn dispatch_notify_event(res: notify::Result<Event>, routes: &Routes) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "File watcher error");
            return;
        }
    };

    if !is_write(&event.kind) {
        trace!(kind = ?event.kind, "Ignoring event kind");
        return;
    }

    let routes = routes.read().unwrap_or_else(PoisonError::into_inner);
    for path in &event.paths {
        if let Some(route) = routes.get(path) {
            route.notify(path);
        }
    }
}

/// Captures each settled burst until the debouncer shuts down.
async fn run_capture_loop(
    mut settled_rx: mpsc::Receiver<PathBuf>,
    poll_interval: Duration,
    pipeline: CapturePipeline,
    events: broadcast::Sender<WatchEvent>,
    state: Arc<StateCell>,
) {
    while let Some(path) = settled_rx.recv().await {
        if state.is_stopped() {
            break;
        }

        wait_until_stable(&path, poll_interval).await;

        if !state.advance(WatchState::Captured) {
            break;
        }

        let event = match pipeline.capture(&path).await {
            Ok(capture) => {
                info!(
                    path = %path.display(),
                    record_id = capture.record.id,
                    "Captured change"
                );
                match capture.anomaly {
                    Some(anomaly) => WatchEvent::OrderingAnomaly {
                        path: path.clone(),
                        previous: anomaly.previous,
                        current: anomaly.current,
                    },
                    None => WatchEvent::FileChanged {
                        path: path.clone(),
                        record_id: capture.record.id,
                        modified_time: capture.record.modified_time,
                    },
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropped change capture");
                WatchEvent::CaptureFailed {
                    path: path.clone(),
                    message: e.to_string(),
                }
            }
        };

        // A notification during the capture keeps the file in Debouncing
        state.transition(WatchState::Captured, WatchState::Watching);

        // No subscribers is not an error
        let _ = events.send(event);
    }

    trace!("Capture loop shutting down");
}

/// Samples size and modification time until they hold still for one interval.
async fn wait_until_stable(path: &Path, poll_interval: Duration) {
    let mut last = file_signature(path).await;

    for _ in 0..MAX_SETTLE_CHECKS {
        tokio::time::sleep(poll_interval).await;
        let current = file_signature(path).await;
        if current == last {
            return;
        }
        last = current;
    }

    warn!(path = %path.display(), "File kept changing; capturing current state");
}

async fn file_signature(path: &Path) -> Option<(u64, SystemTime)> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.len(), metadata.modified().ok()?))
}

/// Owns the set of live watchers, at most one per path.
///
/// All watchers share one OS watch handle. Each parent directory is
/// subscribed while at least one of its files is watched.
#[derive(Debug)]
pub struct WatchSupervisor {
    config: WatchConfig,
    pipeline: CapturePipeline,
    events: broadcast::Sender<WatchEvent>,
    handles: HashMap<PathBuf, WatcherHandle>,
    routes: Arc<Routes>,
    /// Watched files per subscribed directory.
    directories: HashMap<PathBuf, usize>,
    notifier: Option<RecommendedWatcher>,
}

impl WatchSupervisor {
    /// Creates a supervisor with no active watchers.
    #[must_use]
    pub fn new(
        config: WatchConfig,
        pipeline: CapturePipeline,
        events: broadcast::Sender<WatchEvent>,
    ) -> Self {
        Self {
            config,
            pipeline,
            events,
            handles: HashMap::new(),
            routes: Arc::default(),
            directories: HashMap::new(),
            notifier: None,
        }
    }

    /// Starts one watcher per file.
    ///
    /// Files whose watch cannot be established are logged and skipped; they
    /// do not affect the others. Returns the number of watchers started.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::AlreadyWatching`] without starting anything if
    /// any of the files already has a watcher. Call [`stop_all`](Self::stop_all)
    /// first to replace the whole set.
    pub fn start_all(&mut self, files: &[TrackedFile]) -> Result<usize, WatcherError> {
        if let Some(existing) = files
            .iter()
            .find(|file| self.handles.contains_key(&file.file_path))
        {
            return Err(WatcherError::AlreadyWatching(existing.file_path.clone()));
        }

        let mut started = 0;
        for file in files {
            match self.start(&file.file_path) {
                Ok(()) => started += 1,
                Err(WatcherError::AlreadyWatching(path)) => {
                    debug!(path = %path.display(), "Duplicate entry skipped");
                }
                Err(e) => {
                    warn!(path = %file.file_path.display(), error = %e, "Failed to start watcher");
                }
            }
        }

        info!(started, requested = files.len(), "Watchers started");
        Ok(started)
    }

    /// Starts watching a single file.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::AlreadyWatching`] if the path is already
    /// watched, or an error if the OS watch cannot be established.
    pub fn start(&mut self, path: &Path) -> Result<(), WatcherError> {
        if self.handles.contains_key(path) {
            return Err(WatcherError::AlreadyWatching(path.to_path_buf()));
        }
        let Some(parent) = path.parent().filter(|_| path.file_name().is_some()) else {
            return Err(WatcherError::NoParentDirectory(path.to_path_buf()));
        };

        // Editors that save by rename replace the inode, so the parent is watched
        if !self.directories.contains_key(parent) {
            self.notifier()?.watch(parent, RecursiveMode::NonRecursive)?;
            debug!(directory = %parent.display(), "Subscribed to directory");
        }
        *self.directories.entry(parent.to_path_buf()).or_insert(0) += 1;

        let handle = WatcherHandle::spawn(
            path.to_path_buf(),
            self.config,
            self.pipeline.clone(),
            self.events.clone(),
        );
        self.write_routes()
            .insert(path.to_path_buf(), handle.route.clone());
        self.handles.insert(path.to_path_buf(), handle);

        info!(path = %path.display(), "Started watching file");
        Ok(())
    }

    /// Stops watching `path`. Returns `false` if it was not watched.
    pub fn stop(&mut self, path: &Path) -> bool {
        let Some(handle) = self.handles.remove(path) else {
            return false;
        };
        self.write_routes().remove(path);
        if let Some(parent) = path.parent() {
            self.release_directory(parent);
        }
        drop(handle);
        true
    }

    /// Stops every watcher. Idempotent; returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.handles.len();
        self.write_routes().clear();
        self.handles.clear();
        self.directories.clear();
        self.notifier = None;
        if stopped > 0 {
            info!(stopped, "Watchers stopped");
        }
        stopped
    }

    /// Returns the state of the watcher for `path`, or `None` if unwatched.
    #[must_use]
    pub fn state(&self, path: &Path) -> Option<WatchState> {
        self.handles.get(path).map(WatcherHandle::state)
    }

    /// Returns `true` if `path` has a live watcher.
    #[must_use]
    pub fn is_watching(&self, path: &Path) -> bool {
        self.handles.contains_key(path)
    }

    /// Returns the number of live watchers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no file is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns the watched paths in sorted order.
    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.handles.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns the OS watch handle, creating it on first use.
    fn notifier(&mut self) -> Result<&mut RecommendedWatcher, WatcherError> {
        let notifier = match self.notifier.take() {
            Some(notifier) => notifier,
            None => {
                let routes = Arc::clone(&self.routes);
                RecommendedWatcher::new(
                    move |res: notify::Result<Event>| dispatch_notify_event(res, &routes),
                    NotifyConfig::default(),
                )?
            }
        };
        Ok(self.notifier.insert(notifier))
    }

    fn release_directory(&mut self, directory: &Path) {
        let Some(count) = self.directories.get_mut(directory) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }

        self.directories.remove(directory);
        if let Some(notifier) = self.notifier.as_mut() {
            if let Err(e) = notifier.unwatch(directory) {
                debug!(directory = %directory.display(), error = %e, "Directory watch already gone");
            }
        }
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, HashMap<PathBuf, Route>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WatchSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
