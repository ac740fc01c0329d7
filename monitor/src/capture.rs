//! The capture pipeline: stat, extract, append.
//!
//! Both the live watchers and the reconciliation pass record snapshots through
//! [`CapturePipeline`], so a backfill and a live capture produce identical
//! records.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::extract::{self, ExtractError};
use crate::store::{ChangeStore, HistoryStores, OrderingAnomaly};
use crate::types::{file_modified_at, ChangeRecord};

/// Outcome of a successful capture.
#[derive(Debug, Clone)]
pub struct Capture {
    /// The record appended to the file's history.
    pub record: ChangeRecord,

    /// Set when the new record is older than the record appended before it.
    pub anomaly: Option<OrderingAnomaly>,
}

/// Records snapshots of tracked files into their histories.
///
/// Every append to one history happens under that history's writer lock, so
/// a live capture and a reconciliation backfill of the same file never
/// interleave.
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    stores: Arc<HistoryStores>,
}

impl CapturePipeline {
    /// Creates a pipeline that writes through `stores`.
    #[must_use]
    pub fn new(stores: Arc<HistoryStores>) -> Self {
        Self { stores }
    }

    /// Returns the history store cache.
    #[must_use]
    pub fn stores(&self) -> &Arc<HistoryStores> {
        &self.stores
    }

    /// Reads the current state of `path` and appends it to its history.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Access`] if the file is missing or unreadable
    /// - [`MonitorError::Extraction`] if its content cannot be converted
    /// - [`MonitorError::Store`] if the history cannot be written
    ///
    /// In every case nothing is appended.
    pub async fn capture(&self, path: &Path) -> Result<Capture> {
        let modified_time = current_modified_time(path).await?;

        let store = self.stores.open(path).await?;
        let _writer = store.lock_writer().await;
        let capture = append_snapshot(&store, path, modified_time).await?;
        Ok(capture)
    }

    /// Records the initial snapshot of `path` if its history is still empty.
    ///
    /// Returns the new record, or `None` when the history already has one.
    ///
    /// # Errors
    ///
    /// Same as [`capture`](Self::capture).
    pub async fn ensure_initial_snapshot(&self, path: &Path) -> Result<Option<ChangeRecord>> {
        let store = self.stores.open(path).await?;
        let _writer = store.lock_writer().await;
        if !store.is_empty().await? {
            return Ok(None);
        }

        let modified_time = current_modified_time(path).await?;
        let capture = append_snapshot(&store, path, modified_time).await?;
        info!(path = %path.display(), id = capture.record.id, "Recorded initial snapshot");
        Ok(Some(capture.record))
    }

    /// Appends the current state of `path` unless its history already holds
    /// a snapshot at least as recent as the file.
    ///
    /// # Errors
    ///
    /// Same as [`capture`](Self::capture).
    pub async fn backfill(&self, path: &Path) -> Result<Option<Capture>> {
        let modified_time = current_modified_time(path).await?;

        let store = self.stores.open(path).await?;
        let _writer = store.lock_writer().await;
        if let Some(latest) = store.latest_modified_time().await? {
            if latest >= modified_time {
                debug!(path = %path.display(), "History already holds current state");
                return Ok(None);
            }
        }

        let capture = append_snapshot(&store, path, modified_time).await?;
        Ok(Some(capture))
    }
}

async fn current_modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| MonitorError::access(path, e))?;
    file_modified_at(&metadata).map_err(|e| MonitorError::access(path, e))
}

/// Extracts `path` and appends it. The caller holds the store's writer lock.
async fn append_snapshot(
    store: &ChangeStore,
    path: &Path,
    modified_time: DateTime<Utc>,
) -> Result<Capture> {
    let content = extract::extract(path).await.map_err(|e| match e {
        ExtractError::Read { path, source } => MonitorError::access(path, source),
        other => MonitorError::Extraction(other),
    })?;

    let previous = store.last_appended().await?;
    let id = store.append(path, &modified_time, &content).await?;

    let anomaly = previous
        .filter(|prev| modified_time < prev.modified_time)
        .map(|prev| OrderingAnomaly {
            path: path.to_path_buf(),
            previous_id: prev.id,
            previous: prev.modified_time,
            id,
            current: modified_time,
        });

    if let Some(anomaly) = &anomaly {
        warn!(path = %path.display(), error = %anomaly, "Captured record is out of order");
    }

    debug!(path = %path.display(), id, bytes = content.len(), "Captured snapshot");

    Ok(Capture {
        record: ChangeRecord {
            id,
            file_path: path.to_path_buf(),
            modified_time,
            content,
        },
        anomaly,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_HISTORY_SUFFIX;
    use std::time::{Duration, SystemTime};

    fn pipeline() -> CapturePipeline {
        CapturePipeline::new(Arc::new(HistoryStores::new(DEFAULT_HISTORY_SUFFIX)))
    }

    #[tokio::test]
    async fn capture_appends_current_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let pipeline = pipeline();
        let capture = pipeline.capture(&path).await.unwrap();

        assert_eq!(capture.record.content, "hello");
        assert_eq!(capture.record.file_path, path);
        assert!(capture.anomaly.is_none());
        assert!(dir.path().join("notes.txt.db").exists());
    }

    #[tokio::test]
    async fn capture_missing_file_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");

        let err = pipeline().capture(&path).await.unwrap_err();
        assert!(matches!(err, MonitorError::Access { .. }));
        assert!(!dir.path().join("missing.txt.db").exists());
    }

    #[tokio::test]
    async fn capture_corrupt_document_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip archive").unwrap();

        let pipeline = pipeline();
        let err = pipeline.capture(&path).await.unwrap_err();
        assert!(matches!(err, MonitorError::Extraction(_)));

        let store = pipeline.stores().open(&path).await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn initial_snapshot_is_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draft.md");
        std::fs::write(&path, "# Draft").unwrap();

        let pipeline = pipeline();
        let first = pipeline.ensure_initial_snapshot(&path).await.unwrap();
        let second = pipeline.ensure_initial_snapshot(&path).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());

        let store = pipeline.stores().open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn capture_reports_ordering_anomaly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.txt");
        std::fs::write(&path, "v1").unwrap();

        let pipeline = pipeline();
        pipeline.capture(&path).await.unwrap();

        // Move the file's mtime into the past
        let past = SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(past).unwrap();
        drop(file);

        let capture = pipeline.capture(&path).await.unwrap();
        let anomaly = capture.anomaly.expect("expected an ordering anomaly");
        assert_eq!(anomaly.id, capture.record.id);
        assert!(anomaly.current < anomaly.previous);
    }

    #[tokio::test]
    async fn backfill_skips_state_already_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "v1").unwrap();

        let pipeline = pipeline();
        pipeline.capture(&path).await.unwrap();

        assert!(pipeline.backfill(&path).await.unwrap().is_none());
        let store = pipeline.stores().open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backfill_appends_when_file_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "offline edit").unwrap();

        let pipeline = pipeline();
        let store = pipeline.stores().open(&path).await.unwrap();
        let stale = current_modified_time(&path).await.unwrap() - chrono::Duration::hours(1);
        store.append(&path, &stale, "old").await.unwrap();

        let capture = pipeline.backfill(&path).await.unwrap().unwrap();
        assert_eq!(capture.record.content, "offline edit");
        assert!(capture.anomaly.is_none());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_backfills_append_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.md");
        std::fs::write(&path, "same state").unwrap();

        let pipeline = pipeline();
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = pipeline.clone();
                let path = path.clone();
                tokio::spawn(async move { pipeline.backfill(&path).await })
            })
            .collect();

        let mut appended = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                appended += 1;
            }
        }

        assert_eq!(appended, 1);
        let store = pipeline.stores().open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_in_flight_completes_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "in flight").unwrap();

        let pipeline = pipeline();
        let store = pipeline.stores().open(&path).await.unwrap();
        let held = store.lock_writer().await;

        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            let path = path.clone();
            async move { pipeline.capture(&path).await }
        });

        // The capture is now parked on the writer lock
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.stores().evict(&path).await;
        drop(held);

        let capture = task.await.unwrap().unwrap();
        assert_eq!(capture.record.content, "in flight");
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
