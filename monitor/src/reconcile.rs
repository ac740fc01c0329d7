//! Startup reconciliation of the registry against the filesystem.
//!
//! For each tracked file the engine checks that it still exists, compares the
//! recorded modification time with the current one and backfills a snapshot
//! when the file changed while nothing was watching it. Per-file checks run
//! concurrently; restarting the watchers afterwards is the caller's critical
//! section (see [`Monitor::list_tracked_files`](crate::Monitor::list_tracked_files)).

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::capture::CapturePipeline;
use crate::types::{file_modified_at, ReconcileReport, TrackedFile};

/// What happened to one verified file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Unchanged,
    Initialized,
    Backfilled,
}

#[derive(Debug)]
enum Check {
    Verified(TrackedFile, Action),
    NotFound(TrackedFile),
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Every input entry, in input order, with updated `modified_at` values.
    pub files: Vec<TrackedFile>,

    /// Entries that exist on disk.
    pub verified: Vec<TrackedFile>,

    /// Entries that are missing or unreadable.
    pub not_found: Vec<TrackedFile>,

    /// Number of files that received a backfill record.
    pub backfilled: usize,

    /// Number of files whose empty history received its initial snapshot.
    pub initialized: usize,
}

impl ReconcileOutcome {
    /// Returns the `{verified, notFound}` view handed to callers.
    #[must_use]
    pub fn report(&self) -> ReconcileReport {
        ReconcileReport {
            verified: self.verified.clone(),
            not_found: self.not_found.clone(),
        }
    }
}

/// Verifies tracked files and backfills changes missed while unmonitored.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    pipeline: CapturePipeline,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(pipeline: CapturePipeline) -> Self {
        Self { pipeline }
    }

    /// Reconciles `files` against the filesystem.
    ///
    /// Never fails as a whole: a file that cannot be checked is classified as
    /// not found, and a failed backfill leaves its entry untouched so the next
    /// pass retries it. Histories of missing files are left intact.
    pub async fn reconcile(&self, files: Vec<TrackedFile>) -> ReconcileOutcome {
        let checks = join_all(files.into_iter().map(|file| self.check(file))).await;

        let mut outcome = ReconcileOutcome::default();
        for check in checks {
            match check {
                Check::Verified(file, action) => {
                    match action {
                        Action::Initialized => outcome.initialized += 1,
                        Action::Backfilled => outcome.backfilled += 1,
                        Action::Unchanged => {}
                    }
                    outcome.files.push(file.clone());
                    outcome.verified.push(file);
                }
                Check::NotFound(file) => {
                    outcome.files.push(file.clone());
                    outcome.not_found.push(file);
                }
            }
        }

        info!(
            verified = outcome.verified.len(),
            not_found = outcome.not_found.len(),
            backfilled = outcome.backfilled,
            initialized = outcome.initialized,
            "Reconciliation complete"
        );

        outcome
    }

    async fn check(&self, mut file: TrackedFile) -> Check {
        let path = file.file_path.clone();

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(path = %path.display(), "Tracked file not found");
            return Check::NotFound(file);
        }

        let current = match tokio::fs::metadata(&path)
            .await
            .and_then(|metadata| file_modified_at(&metadata))
        {
            Ok(current) => current,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Tracked file is unreadable");
                return Check::NotFound(file);
            }
        };

        let action = self.sync_history(&mut file, current).await;
        Check::Verified(file, action)
    }

    /// Brings the history up to date with the file on disk.
    async fn sync_history(&self, file: &mut TrackedFile, current: DateTime<Utc>) -> Action {
        let path = file.file_path.clone();

        // An empty history gets its initial snapshot, which also covers any drift
        match self.pipeline.ensure_initial_snapshot(&path).await {
            Ok(Some(record)) => {
                file.modified_at = record.modified_time;
                return Action::Initialized;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to record initial snapshot");
                return Action::Unchanged;
            }
        }

        if current <= file.modified_at {
            debug!(path = %path.display(), "Tracked file unchanged");
            return Action::Unchanged;
        }

        // The history, not the registry, decides whether the change is missing
        match self.pipeline.backfill(&path).await {
            Ok(Some(capture)) => {
                info!(
                    path = %path.display(),
                    recorded = %file.modified_at,
                    actual = %capture.record.modified_time,
                    "Backfilled change made while unmonitored"
                );
                file.modified_at = capture.record.modified_time;
                Action::Backfilled
            }
            Ok(None) => {
                debug!(path = %path.display(), "Change already captured, updating entry");
                file.modified_at = current;
                Action::Unchanged
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Backfill failed, will retry next pass");
                Action::Unchanged
            }
        }
    }
}
