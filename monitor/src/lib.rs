//! Filetrail Monitor - versioned history for watched documents.
//!
//! This crate watches a set of user-selected files and records every settled
//! modification as an immutable, timestamped snapshot in a per-file history.
//!
//! # Overview
//!
//! Control flow, leaves first:
//!
//! 1. The [`registry`] supplies the tracked files.
//! 2. The [`reconcile`] engine verifies each file and backfills changes made
//!    while nothing was watching.
//! 3. The [`watcher`] supervisor starts one debounced watcher per verified file.
//! 4. On each settled change the [`capture`] pipeline runs the [`extract`]or and
//!    appends a record to the file's [`store`].
//! 5. Subscribers receive a [`WatchEvent`].
//!
//! [`Monitor`] exposes these as the operations used by the surrounding
//! application.
//!
//! # Modules
//!
//! - [`types`]: Shared data types and timestamp helpers
//! - [`extract`]: Plain text and `.docx` to Markdown extraction
//! - [`store`]: Append-only SQLite history per tracked file
//! - [`capture`]: Stat, extract and append pipeline
//! - [`watcher`]: Per-file watchers and their supervisor
//! - [`reconcile`]: Startup reconciliation and backfill
//! - [`registry`]: Tracked-file list persistence
//! - [`monitor`]: The externally exposed operations
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations
//! - [`utils`]: Shared utilities (debouncing)

pub mod capture;
pub mod config;
pub mod error;
pub mod extract;
pub mod monitor;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod types;
pub mod utils;
pub mod watcher;

pub use capture::{Capture, CapturePipeline};
pub use config::{Config, ConfigError};
pub use error::{MonitorError, Result};
pub use extract::{extract, ExtractError, SourceFormat};
pub use monitor::Monitor;
pub use reconcile::{ReconcileOutcome, ReconciliationEngine};
pub use registry::{JsonFileRegistry, MemoryRegistry, RegistryError, TrackedFileRegistry};
pub use store::{ChangeStore, HistoryStores, OrderingAnomaly, StoreError};
pub use types::{ChangeRecord, ReconcileReport, Reply, TrackedFile, WatchEvent};
pub use utils::Debouncer;
pub use watcher::{WatchConfig, WatchState, WatchSupervisor, WatcherError};
