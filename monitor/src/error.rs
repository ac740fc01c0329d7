//! Error types for the Filetrail Monitor.
//!
//! Every component has its own error enum; [`MonitorError`] rolls them up for
//! the operations exposed to callers.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::watcher::WatcherError;

/// Errors that can occur during monitor operations.
///
/// All failures are local to one file's pipeline; none of them stop the
/// watchers of other files.
///
/// # Examples
///
/// ```
/// use filetrail_monitor::error::MonitorError;
///
/// let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
/// let err = MonitorError::access("/notes/draft.md", err);
/// assert!(err.to_string().starts_with("cannot access /notes/draft.md"));
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A tracked file is missing or unreadable.
    ///
    /// The file is excluded from active watching; its history is kept.
    #[error("cannot access {}: {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Content could not be extracted; the capture attempt was dropped.
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractError),

    /// A history operation failed; the capture attempt was dropped.
    #[error("history store error: {0}")]
    Store(#[from] StoreError),

    /// The tracked-file registry could not be read or written.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(#[from] WatcherError),

    /// The file's extension is not one the monitor accepts.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// The path is not in the tracked-file registry.
    #[error("file is not tracked: {}", .0.display())]
    NotTracked(PathBuf),
}

impl MonitorError {
    /// Builds an [`MonitorError::Access`] for `path`.
    pub fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Access {
            path: path.into(),
            source,
        }
    }
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
