//! The operations exposed to the surrounding application.
//!
//! [`Monitor`] ties the registry, the reconciliation engine and the watch
//! supervisor together. The tracked-file list is the only shared mutable
//! state, so every operation that reads and rewrites it holds the registry
//! lock for its whole duration. The supervisor lock is always taken after the
//! registry lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::capture::CapturePipeline;
use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::reconcile::ReconciliationEngine;
use crate::registry::{JsonFileRegistry, TrackedFileRegistry};
use crate::store::HistoryStores;
use crate::types::{file_modified_at, ChangeRecord, ReconcileReport, TrackedFile, WatchEvent};
use crate::watcher::{WatchConfig, WatchState, WatchSupervisor};

/// Change-capture engine for a set of tracked files.
pub struct Monitor {
    config: Config,
    registry: Mutex<Box<dyn TrackedFileRegistry>>,
    supervisor: Mutex<WatchSupervisor>,
    pipeline: CapturePipeline,
    engine: ReconciliationEngine,
    events: broadcast::Sender<WatchEvent>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor backed by the JSON registry at `config.registry_path`.
    ///
    /// No watcher runs until [`list_tracked_files`](Self::list_tracked_files)
    /// is called. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = JsonFileRegistry::new(&config.registry_path);
        Self::with_registry(config, Box::new(registry))
    }

    /// Creates a monitor backed by a custom registry.
    #[must_use]
    pub fn with_registry(config: Config, registry: Box<dyn TrackedFileRegistry>) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let stores = Arc::new(HistoryStores::new(config.history_suffix.clone()));
        let pipeline = CapturePipeline::new(stores);
        let supervisor =
            WatchSupervisor::new(WatchConfig::from(&config), pipeline.clone(), events.clone());

        Self {
            engine: ReconciliationEngine::new(pipeline.clone()),
            config,
            registry: Mutex::new(registry),
            supervisor: Mutex::new(supervisor),
            pipeline,
            events,
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconciles the registry with the filesystem and restarts the watchers.
    ///
    /// Missed changes are backfilled and the updated modification times are
    /// persisted. Entries that were not found stay in the registry; removing
    /// them is the caller's decision. The watcher set is replaced in one
    /// critical section, so it never holds two watchers for one path.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or written.
    pub async fn list_tracked_files(&self) -> Result<ReconcileReport> {
        let registry = self.registry.lock().await;
        let files = registry.load()?;

        let outcome = self.engine.reconcile(files).await;
        registry.save(&outcome.files)?;

        let mut supervisor = self.supervisor.lock().await;
        supervisor.stop_all();
        supervisor.start_all(&outcome.verified)?;

        Ok(outcome.report())
    }

    /// Starts tracking `path`.
    ///
    /// The file's initial snapshot is recorded before it is registered, so a
    /// file whose content cannot be extracted is never tracked. Adding an
    /// already tracked file returns its existing entry.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::UnsupportedFileType`] if the extension is not allowed
    /// - [`MonitorError::Access`] if the file is missing or not a regular file
    /// - extraction, store, registry or watch errors from the steps above
    pub async fn add_tracked_file(&self, path: &Path) -> Result<TrackedFile> {
        if !self.config.is_allowed(path) {
            let kind = path
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            return Err(MonitorError::UnsupportedFileType(kind));
        }

        let path = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| MonitorError::access(path, e))?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| MonitorError::access(&path, e))?;
        if !metadata.is_file() {
            let e = std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file");
            return Err(MonitorError::access(&path, e));
        }
        let modified_at = file_modified_at(&metadata).map_err(|e| MonitorError::access(&path, e))?;

        let registry = self.registry.lock().await;
        let mut files = registry.load()?;

        let entry = match files.iter().find(|f| f.file_path == path) {
            Some(existing) => existing.clone(),
            None => {
                let entry = match self.pipeline.ensure_initial_snapshot(&path).await? {
                    Some(record) => TrackedFile::new(&path, record.modified_time),
                    None => TrackedFile::new(&path, modified_at),
                };
                files.insert(0, entry.clone());
                registry.save(&files)?;
                info!(path = %path.display(), "Tracking file");
                entry
            }
        };

        let mut supervisor = self.supervisor.lock().await;
        if !supervisor.is_watching(&path) {
            supervisor.start(&path)?;
        }

        Ok(entry)
    }

    /// Stops tracking `path` and returns the removed entry.
    ///
    /// The file's history stays on disk and can still be queried.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::NotTracked`] if the path is not registered, or
    /// an error if the registry cannot be read or written.
    pub async fn remove_tracked_file(&self, path: &Path) -> Result<TrackedFile> {
        let path = resolve(path).await;

        let registry = self.registry.lock().await;
        let mut files = registry.load()?;

        let mut supervisor = self.supervisor.lock().await;
        supervisor.stop(&path);
        drop(supervisor);

        let Some(index) = files.iter().position(|f| f.file_path == path) else {
            return Err(MonitorError::NotTracked(path));
        };
        let removed = files.remove(index);
        registry.save(&files)?;

        self.pipeline.stores().evict(&path).await;
        info!(path = %path.display(), "Stopped tracking file");

        Ok(removed)
    }

    /// Returns the current modification time of `path`, read from disk.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Access`] if the file cannot be inspected.
    pub async fn last_modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| MonitorError::access(path, e))?;
        file_modified_at(&metadata).map_err(|e| MonitorError::access(path, e))
    }

    /// Returns the change history of `path`, most recent first.
    ///
    /// A file that has never been tracked has an empty history.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing history cannot be read.
    pub async fn history(&self, path: &Path) -> Result<Vec<ChangeRecord>> {
        let path = resolve(path).await;
        match self.pipeline.stores().open_existing(&path).await? {
            Some(store) => Ok(store.list_descending().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Subscribes to change notifications.
    ///
    /// Each settled change produces one [`WatchEvent`]. Dropping the receiver
    /// cancels the subscription.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Returns the watcher state for `path`, or `None` if it is not watched.
    pub async fn watch_state(&self, path: &Path) -> Option<WatchState> {
        let path = resolve(path).await;
        self.supervisor.lock().await.state(&path)
    }

    /// Returns the paths that currently have a live watcher.
    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.supervisor.lock().await.watched_paths()
    }

    /// Stops every watcher. Histories and the registry are left as they are.
    pub async fn shutdown(&self) {
        let stopped = self.supervisor.lock().await.stop_all();
        info!(stopped, "Monitor shut down");
    }
}

/// Resolves `path` the way entries are stored: canonical when the file
/// exists, absolute otherwise.
async fn resolve(path: &Path) -> PathBuf {
    match tokio::fs::canonicalize(path).await {
        Ok(canonical) => canonical,
        Err(_) => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::new("/unused/registry.json");
        config.stability_window = Duration::from_millis(150);
        config.poll_interval = Duration::from_millis(20);
        config
    }

    fn monitor() -> Monitor {
        Monitor::with_registry(test_config(), Box::new(MemoryRegistry::default()))
    }

    #[tokio::test]
    async fn add_rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slides.pdf");
        std::fs::write(&path, "x").unwrap();

        let err = monitor().add_tracked_file(&path).await.unwrap_err();
        assert!(matches!(err, MonitorError::UnsupportedFileType(ref ext) if ext == "pdf"));
    }

    #[tokio::test]
    async fn add_missing_file_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = monitor()
            .add_tracked_file(&dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Access { .. }));
    }

    #[tokio::test]
    async fn add_is_idempotent_and_prepends() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.md");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        let monitor = monitor();
        monitor.add_tracked_file(&a).await.unwrap();
        monitor.add_tracked_file(&b).await.unwrap();
        monitor.add_tracked_file(&a).await.unwrap();

        let report = monitor.list_tracked_files().await.unwrap();
        let names: Vec<_> = report.verified.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["b.md", "a.txt"]);
        assert_eq!(monitor.watched_paths().await.len(), 2);
        assert_eq!(monitor.history(&a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_untracked_path_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = monitor()
            .remove_tracked_file(&dir.path().join("never.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NotTracked(_)));
    }

    #[tokio::test]
    async fn remove_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "content").unwrap();

        let monitor = monitor();
        monitor.add_tracked_file(&a).await.unwrap();
        let removed = monitor.remove_tracked_file(&a).await.unwrap();

        assert_eq!(removed.file_name, "a.txt");
        assert_eq!(monitor.watch_state(&a).await, None);
        let history = monitor.history(&a).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "content");
    }

    #[tokio::test]
    async fn history_of_unknown_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = monitor().history(&dir.path().join("x.txt")).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn last_modified_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "x").unwrap();

        let monitor = monitor();
        let expected = file_modified_at(&std::fs::metadata(&a).unwrap()).unwrap();
        assert_eq!(monitor.last_modified(&a).await.unwrap(), expected);

        let err = monitor.last_modified(&dir.path().join("nope.txt")).await.unwrap_err();
        assert!(matches!(err, MonitorError::Access { .. }));
    }

    #[tokio::test]
    async fn list_replaces_watchers_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "x").unwrap();

        let monitor = monitor();
        monitor.add_tracked_file(&a).await.unwrap();
        monitor.list_tracked_files().await.unwrap();
        monitor.list_tracked_files().await.unwrap();

        assert_eq!(monitor.watched_paths().await.len(), 1);
        assert_eq!(monitor.watch_state(&a).await, Some(WatchState::Watching));

        monitor.shutdown().await;
        assert!(monitor.watched_paths().await.is_empty());
    }
}
