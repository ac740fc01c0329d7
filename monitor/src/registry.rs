//! Persistence of the tracked-file list.
//!
//! The monitor only relies on the [`TrackedFileRegistry`] contract: load the
//! whole list, save the whole list. [`JsonFileRegistry`] stores it as
//!
//! ```json
//! { "tracked_files": [ { "filePath": "...", "fileName": "...", "modifiedAt": "..." } ] }
//! ```
//!
//! and [`MemoryRegistry`] keeps it in memory for embedding and tests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::TrackedFile;

/// Errors that can occur while reading or writing the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The registry file could not be read or written.
    #[error("failed to access registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file is not valid JSON.
    #[error("malformed registry {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read/write contract for the list of tracked files.
///
/// Every call reads or replaces the whole list; callers serialize access.
pub trait TrackedFileRegistry: Send + Sync {
    /// Returns the stored list, newest addition first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn load(&self) -> Result<Vec<TrackedFile>, RegistryError>;

    /// Replaces the stored list.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn save(&self, files: &[TrackedFile]) -> Result<(), RegistryError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    tracked_files: Vec<TrackedFile>,
}

/// Registry stored as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    /// Creates a registry backed by the file at `path`. Nothing is read yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl TrackedFileRegistry for JsonFileRegistry {
    fn load(&self) -> Result<Vec<TrackedFile>, RegistryError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registry file missing, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let document: RegistryDocument =
            serde_json::from_str(&contents).map_err(|source| RegistryError::Json {
                path: self.path.clone(),
                source,
            })?;
        Ok(document.tracked_files)
    }

    fn save(&self, files: &[TrackedFile]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let document = RegistryDocument {
            tracked_files: files.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&document).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;

        // Write-then-rename so a crash never leaves a truncated registry
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        file.write_all(&json).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), count = files.len(), "Saved registry");
        Ok(())
    }
}

/// Registry kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    files: Mutex<Vec<TrackedFile>>,
}

impl MemoryRegistry {
    /// Creates a registry holding `files`.
    #[must_use]
    pub fn new(files: Vec<TrackedFile>) -> Self {
        Self {
            files: Mutex::new(files),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrackedFile>> {
        self.files
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TrackedFileRegistry for MemoryRegistry {
    fn load(&self) -> Result<Vec<TrackedFile>, RegistryError> {
        Ok(self.lock().clone())
    }

    fn save(&self, files: &[TrackedFile]) -> Result<(), RegistryError> {
        *self.lock() = files.to_vec();
        Ok(())
    }
}
