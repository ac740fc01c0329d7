//! Append-only change history, one SQLite database per tracked file.
//!
//! A tracked file `F` keeps its history in `F.<suffix>` (`F.db` by default),
//! next to the file itself. Histories are never shared between files and rows
//! are never updated or deleted.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE changes (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     filePath TEXT NOT NULL,
//!     modifiedTime DATETIME NOT NULL,
//!     fileContent BLOB NOT NULL
//! )
//! ```
//!
//! `modifiedTime` holds ISO-8601 UTC timestamps with millisecond precision,
//! so lexical order equals chronological order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::types::{to_iso8601, ChangeRecord};

/// Default suffix appended to a tracked file's path to locate its history.
pub const DEFAULT_HISTORY_SUFFIX: &str = "db";

const CREATE_CHANGES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filePath TEXT NOT NULL,
        modifiedTime DATETIME NOT NULL,
        fileContent BLOB NOT NULL
    )
"#;

/// A record whose modification time is older than the record before it.
///
/// This points at a clock or filesystem anomaly. Histories are never
/// reordered to hide it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "history of {} is out of order: record {id} ({current}) is older than record {previous_id} ({previous})",
    path.display()
)]
pub struct OrderingAnomaly {
    pub path: PathBuf,
    pub previous_id: i64,
    pub previous: DateTime<Utc>,
    pub id: i64,
    pub current: DateTime<Utc>,
}

/// Errors that can occur while reading or writing a history.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database could not be opened, queried or written.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored timestamp could not be parsed.
    #[error("record {id} has an invalid timestamp '{value}'")]
    InvalidTimestamp { id: i64, value: String },

    /// The history's records are not in chronological order.
    #[error(transparent)]
    OrderingAnomaly(#[from] OrderingAnomaly),
}

/// Returns the history location for a tracked file: `<path>.<suffix>`.
#[must_use]
pub fn history_path(file_path: &Path, suffix: &str) -> PathBuf {
    let mut location = file_path.as_os_str().to_os_string();
    location.push(".");
    location.push(suffix);
    PathBuf::from(location)
}

/// Handle to one file's history database.
///
/// Cloning is cheap. Clones share one single-connection pool and one writer
/// lock, which callers hold across a read-then-append sequence.
#[derive(Debug, Clone)]
pub struct ChangeStore {
    pool: SqlitePool,
    location: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl ChangeStore {
    /// Opens (creating if needed) the history database at `location` and
    /// ensures its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(location: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_writer(location.into(), true, Arc::default()).await
    }

    /// Opens an existing history database without creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database does not exist or cannot be opened.
    pub async fn open_existing(location: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_writer(location.into(), false, Arc::default()).await
    }

    async fn open_with_writer(
        location: PathBuf,
        create: bool,
        writer: Arc<Mutex<()>>,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&location)
            .create_if_missing(create);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        debug!(location = %location.display(), "Opened history database");

        let store = Self {
            pool,
            location,
            writer,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Returns the path of the history database.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Waits until no other writer holds this history.
    ///
    /// Held by the capture pipeline from the moment it inspects the history
    /// until its record is appended.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Creates the `changes` table if it does not exist. Safe to call on every open.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_CHANGES_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns the number of records in the history.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Returns `true` if no record has been captured yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.count().await? == 0)
    }

    /// Appends a record and returns its sequence id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append(
        &self,
        file_path: &Path,
        modified_time: &DateTime<Utc>,
        content: &str,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO changes (filePath, modifiedTime, fileContent) VALUES (?, ?, ?)",
        )
        .bind(file_path.to_string_lossy().into_owned())
        .bind(to_iso8601(modified_time))
        .bind(content)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            location = %self.location.display(),
            id,
            modified_time = %to_iso8601(modified_time),
            "Appended change record"
        );
        Ok(id)
    }

    /// Returns every record, most recent `modifiedTime` first.
    ///
    /// Each call re-reads the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn list_descending(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, filePath, modifiedTime, fileContent FROM changes \
             ORDER BY modifiedTime DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Returns the record with the highest id, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn last_appended(&self) -> Result<Option<ChangeRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, filePath, modifiedTime, fileContent FROM changes ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Returns the most recent `modifiedTime` in the history, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored value is malformed.
    pub async fn latest_modified_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            "SELECT id, modifiedTime FROM changes ORDER BY modifiedTime DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let raw: String = row.try_get("modifiedTime")?;
        parse_timestamp(id, &raw).map(Some)
    }

    /// Checks that id order and `modifiedTime` order agree.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OrderingAnomaly`] for the first record that is
    /// older than its predecessor.
    pub async fn verify_ordering(&self) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT id, modifiedTime FROM changes ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut previous: Option<(i64, DateTime<Utc>)> = None;
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let raw: String = row.try_get("modifiedTime")?;
            let current = parse_timestamp(id, &raw)?;

            if let Some((previous_id, previous_time)) = previous {
                if current < previous_time {
                    warn!(
                        location = %self.location.display(),
                        previous_id,
                        id,
                        "History ordering anomaly"
                    );
                    return Err(OrderingAnomaly {
                        path: self.location.clone(),
                        previous_id,
                        previous: previous_time,
                        id,
                        current,
                    }
                    .into());
                }
            }
            previous = Some((id, current));
        }

        Ok(())
    }
}

fn parse_timestamp(id: i64, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            id,
            value: raw.to_string(),
        })
}

fn row_to_record(row: &SqliteRow) -> Result<ChangeRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let file_path: String = row.try_get("filePath")?;
    let raw_time: String = row.try_get("modifiedTime")?;
    let content: String = row.try_get("fileContent")?;

    Ok(ChangeRecord {
        id,
        file_path: PathBuf::from(file_path),
        modified_time: parse_timestamp(id, &raw_time)?,
        content,
    })
}

/// Lazily opened, cached history handles keyed by tracked file path.
///
/// Each path keeps one writer lock for the lifetime of the cache, so a handle
/// that outlives its eviction and a handle opened afterwards still exclude
/// each other.
#[derive(Debug)]
pub struct HistoryStores {
    suffix: String,
    open: Mutex<HashMap<PathBuf, ChangeStore>>,
    writers: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl HistoryStores {
    /// Creates an empty cache that locates histories with `suffix`.
    #[must_use]
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            open: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    async fn writer_for(&self, file_path: &Path) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        Arc::clone(writers.entry(file_path.to_path_buf()).or_default())
    }

    /// Returns where the history of `file_path` lives.
    #[must_use]
    pub fn location_for(&self, file_path: &Path) -> PathBuf {
        history_path(file_path, &self.suffix)
    }

    /// Returns the history of `file_path`, creating the database if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn open(&self, file_path: &Path) -> Result<ChangeStore, StoreError> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(file_path) {
            return Ok(store.clone());
        }

        let writer = self.writer_for(file_path).await;
        let store =
            ChangeStore::open_with_writer(self.location_for(file_path), true, writer).await?;
        info!(
            path = %file_path.display(),
            location = %store.location().display(),
            "History store ready"
        );
        open.insert(file_path.to_path_buf(), store.clone());
        Ok(store)
    }

    /// Returns the history of `file_path` only if its database already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing database cannot be opened.
    pub async fn open_existing(&self, file_path: &Path) -> Result<Option<ChangeStore>, StoreError> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(file_path) {
            return Ok(Some(store.clone()));
        }

        let location = self.location_for(file_path);
        if !tokio::fs::try_exists(&location).await.unwrap_or(false) {
            return Ok(None);
        }

        let writer = self.writer_for(file_path).await;
        let store = ChangeStore::open_with_writer(location, false, writer).await?;
        open.insert(file_path.to_path_buf(), store.clone());
        Ok(Some(store))
    }

    /// Drops the cached handle for `file_path`.
    ///
    /// Clones held by a capture in flight stay usable; the pool closes once
    /// the last of them is dropped.
    pub async fn evict(&self, file_path: &Path) {
        if self.open.lock().await.remove(file_path).is_some() {
            debug!(path = %file_path.display(), "Evicted history store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn time(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    async fn temp_store() -> (tempfile::TempDir, ChangeStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        let store = ChangeStore::open(history_path(&file, DEFAULT_HISTORY_SUFFIX))
            .await
            .unwrap();
        (dir, store, file)
    }

    #[test]
    fn history_path_appends_suffix() {
        assert_eq!(
            history_path(Path::new("/notes/doc.txt"), "db"),
            PathBuf::from("/notes/doc.txt.db")
        );
        assert_eq!(
            history_path(Path::new("/notes/report.docx"), "history"),
            PathBuf::from("/notes/report.docx.history")
        );
    }

    #[tokio::test]
    async fn new_store_is_empty_and_schema_is_idempotent() {
        let (_dir, store, _file) = temp_store().await;

        assert!(store.is_empty().await.unwrap());
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let (_dir, store, file) = temp_store().await;

        let first = store.append(&file, &time(0), "one").await.unwrap();
        let second = store.append(&file, &time(5), "two").await.unwrap();

        assert!(second > first);
        assert!(!store.is_empty().await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_descending_orders_by_modified_time() {
        let (_dir, store, file) = temp_store().await;

        store.append(&file, &time(0), "first").await.unwrap();
        store.append(&file, &time(10), "second").await.unwrap();
        store.append(&file, &time(20), "third").await.unwrap();

        let records = store.list_descending().await.unwrap();
        let contents: Vec<_> = records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
        assert_eq!(records[0].file_path, file);
        assert_eq!(records[0].modified_time, time(20));
    }

    #[tokio::test]
    async fn content_round_trips_exactly() {
        let (_dir, store, file) = temp_store().await;
        let content = "# Title\n\nunicode ✓ and 'quotes' \"double\"\r\n";

        store.append(&file, &time(0), content).await.unwrap();

        let last = store.last_appended().await.unwrap().unwrap();
        assert_eq!(last.content, content);
    }

    #[tokio::test]
    async fn latest_modified_time_follows_time_not_id() {
        let (_dir, store, file) = temp_store().await;
        assert_eq!(store.latest_modified_time().await.unwrap(), None);

        store.append(&file, &time(30), "late").await.unwrap();
        store.append(&file, &time(10), "skewed").await.unwrap();

        assert_eq!(store.latest_modified_time().await.unwrap(), Some(time(30)));
    }

    #[tokio::test]
    async fn verify_ordering_accepts_monotonic_history() {
        let (_dir, store, file) = temp_store().await;

        store.append(&file, &time(0), "a").await.unwrap();
        store.append(&file, &time(0), "b").await.unwrap();
        store.append(&file, &time(3), "c").await.unwrap();

        store.verify_ordering().await.unwrap();
    }

    #[tokio::test]
    async fn verify_ordering_reports_anomaly() {
        let (_dir, store, file) = temp_store().await;

        let first = store.append(&file, &time(60), "later").await.unwrap();
        let second = store.append(&file, &time(0), "earlier").await.unwrap();

        let err = store.verify_ordering().await.unwrap_err();
        match err {
            StoreError::OrderingAnomaly(anomaly) => {
                assert_eq!(anomaly.previous_id, first);
                assert_eq!(anomaly.id, second);
                assert_eq!(anomaly.previous, time(60));
                assert_eq!(anomaly.current, time(0));
            }
            other => panic!("expected ordering anomaly, got {other:?}"),
        }

        // Listing still returns what was written, sorted by time
        let records = store.list_descending().await.unwrap();
        assert_eq!(records[0].content, "later");
    }

    #[tokio::test]
    async fn reopen_keeps_history() {
        let (_dir, store, file) = temp_store().await;
        store.append(&file, &time(0), "kept").await.unwrap();
        let location = store.location().to_path_buf();
        drop(store);

        let reopened = ChangeStore::open(location).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_returns_shared_handle() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.md");
        let stores = HistoryStores::new(DEFAULT_HISTORY_SUFFIX);

        let a = stores.open(&file).await.unwrap();
        a.append(&file, &time(0), "x").await.unwrap();
        let b = stores.open(&file).await.unwrap();

        assert_eq!(b.count().await.unwrap(), 1);
        assert_eq!(b.location(), dir.path().join("doc.md.db"));
    }

    #[tokio::test]
    async fn open_existing_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("never.txt");
        let stores = HistoryStores::new(DEFAULT_HISTORY_SUFFIX);

        assert!(stores.open_existing(&file).await.unwrap().is_none());
        assert!(!stores.location_for(&file).exists());
    }

    #[tokio::test]
    async fn evict_then_open_existing_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        let stores = HistoryStores::new(DEFAULT_HISTORY_SUFFIX);

        stores.open(&file).await.unwrap().append(&file, &time(0), "x").await.unwrap();
        stores.evict(&file).await;

        let store = stores.open_existing(&file).await.unwrap().unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn evicted_handle_stays_writable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        let stores = HistoryStores::new(DEFAULT_HISTORY_SUFFIX);

        let in_flight = stores.open(&file).await.unwrap();
        stores.evict(&file).await;

        in_flight.append(&file, &time(0), "late write").await.unwrap();
        let reopened = stores.open_existing(&file).await.unwrap().unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn writer_lock_survives_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        let stores = HistoryStores::new(DEFAULT_HISTORY_SUFFIX);

        let before = stores.open(&file).await.unwrap();
        let _held = before.lock_writer().await;
        stores.evict(&file).await;

        let after = stores.open(&file).await.unwrap();
        assert!(after.writer.try_lock().is_err());
    }
}
