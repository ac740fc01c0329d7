//! Shared data types for tracked files and their histories.
//!
//! All types serialize to camelCase JSON so registry files and CLI output stay
//! readable by the surrounding application.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A file the monitor has been asked to version.
///
/// Identity is the absolute `file_path`. The registry owns these entries; the
/// reconciliation pass treats them as an input snapshot and writes back an
/// updated `modified_at` when drift is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFile {
    /// Absolute path of the tracked file.
    pub file_path: PathBuf,

    /// Display name, normally the path's basename.
    pub file_name: String,

    /// Last known modification time of the file.
    pub modified_at: DateTime<Utc>,
}

impl TrackedFile {
    /// Creates an entry for `file_path`, deriving the display name from its basename.
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>, modified_at: DateTime<Utc>) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string_lossy().into_owned());

        Self {
            file_path,
            file_name,
            modified_at,
        }
    }
}

/// One immutable snapshot in a file's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Monotonically increasing sequence number within the history.
    pub id: i64,

    /// Path of the file this record belongs to.
    pub file_path: PathBuf,

    /// Modification time of the file when the snapshot was captured.
    pub modified_time: DateTime<Utc>,

    /// Extracted textual content at capture time.
    pub content: String,
}

/// Notifications published to subscribers of the monitor.
///
/// Uses serde's internally tagged representation for clean JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// A settled change was captured and appended to the file's history.
    #[serde(rename_all = "camelCase")]
    FileChanged {
        path: PathBuf,
        record_id: i64,
        modified_time: DateTime<Utc>,
    },

    /// A settled change could not be captured; the attempt was dropped.
    CaptureFailed { path: PathBuf, message: String },

    /// A captured record is older than the record before it.
    OrderingAnomaly {
        path: PathBuf,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

impl WatchEvent {
    /// Returns the path the event refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::FileChanged { path, .. }
            | Self::CaptureFailed { path, .. }
            | Self::OrderingAnomaly { path, .. } => path,
        }
    }
}

/// Result of listing the tracked files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Files that exist and are being watched.
    pub verified: Vec<TrackedFile>,

    /// Files that could not be found or read.
    pub not_found: Vec<TrackedFile>,
}

/// A result value for callers outside the crate: either data or a readable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply<T> {
    pub error: Option<String>,
    pub data: Option<T>,
}

impl<T, E: Display> From<Result<T, E>> for Reply<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self {
                error: None,
                data: Some(data),
            },
            Err(e) => Self {
                error: Some(e.to_string()),
                data: None,
            },
        }
    }
}

/// Reads a file's modification time at millisecond precision.
///
/// Registry and history timestamps are stored with millisecond precision, so
/// the live value is truncated the same way before any comparison.
///
/// # Errors
///
/// Returns an error if the platform does not report modification times.
pub fn file_modified_at(metadata: &std::fs::Metadata) -> std::io::Result<DateTime<Utc>> {
    let modified = metadata.modified()?;
    Ok(DateTime::<Utc>::from(modified).trunc_subsecs(3))
}

/// Formats a timestamp as ISO-8601 UTC with millisecond precision (`...123Z`).
#[must_use]
pub fn to_iso8601(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn tracked_file_derives_display_name() {
        let file = TrackedFile::new("/home/user/notes/draft.md", sample_time());
        assert_eq!(file.file_name, "draft.md");
        assert_eq!(file.file_path, PathBuf::from("/home/user/notes/draft.md"));
    }

    #[test]
    fn tracked_file_serializes_camel_case() {
        let file = TrackedFile::new("/tmp/a.txt", sample_time());
        let json = serde_json::to_value(&file).unwrap();

        assert_eq!(json["filePath"], "/tmp/a.txt");
        assert_eq!(json["fileName"], "a.txt");
        assert_eq!(json["modifiedAt"], "2024-03-01T12:30:00Z");
    }

    #[test]
    fn tracked_file_reads_millisecond_timestamps() {
        let json = r#"{"filePath":"/tmp/a.txt","fileName":"a.txt","modifiedAt":"2024-03-01T12:30:00.250Z"}"#;
        let file: TrackedFile = serde_json::from_str(json).unwrap();

        assert_eq!(file.modified_at.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn watch_event_is_tagged() {
        let event = WatchEvent::FileChanged {
            path: PathBuf::from("/tmp/a.txt"),
            record_id: 3,
            modified_time: sample_time(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "file_changed");
        assert_eq!(json["recordId"], 3);
        assert_eq!(event.path(), Path::new("/tmp/a.txt"));
    }

    #[test]
    fn reply_from_ok_and_err() {
        let ok: Reply<u32> = Ok::<u32, String>(5).into();
        assert_eq!(ok.data, Some(5));
        assert!(ok.error.is_none());

        let err: Reply<u32> = Err::<u32, String>("file not found".to_string()).into();
        assert!(err.data.is_none());
        assert_eq!(err.error.as_deref(), Some("file not found"));
    }

    #[test]
    fn iso8601_uses_milliseconds() {
        assert_eq!(to_iso8601(&sample_time()), "2024-03-01T12:30:00.000Z");
    }

    #[test]
    fn modified_at_is_truncated_to_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();

        let modified = file_modified_at(&std::fs::metadata(&path).unwrap()).unwrap();
        assert_eq!(modified.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
