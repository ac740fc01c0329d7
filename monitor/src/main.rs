//! Filetrail - versioned history for watched documents.
//!
//! # Commands
//!
//! - `filetrail run`: reconcile tracked files, then watch and record changes
//! - `filetrail list`: reconcile and print tracked files
//! - `filetrail add <path>` / `filetrail remove <path>`: manage tracked files
//! - `filetrail history <path>`: print a file's recorded snapshots
//! - `filetrail last-modified <path>`: print a file's modification time
//!
//! # Environment Variables
//!
//! See the [`config`](filetrail_monitor::config) module for available
//! configuration options.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use filetrail_monitor::types::{to_iso8601, Reply};
use filetrail_monitor::{Config, Monitor, MonitorError, WatchEvent};

/// Filetrail - versioned history for watched documents.
///
/// Records every settled change of the tracked files into a per-file
/// history stored next to each file.
#[derive(Parser, Debug)]
#[command(name = "filetrail")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    FILETRAIL_REGISTRY_PATH       Registry file (default: ~/.filetrail/tracked_files.json)
    FILETRAIL_STABILITY_MS        Quiet period before capture (default: 2000)
    FILETRAIL_POLL_INTERVAL_MS    Settle check interval (default: 100)
    FILETRAIL_HISTORY_SUFFIX      History store suffix (default: db)
    FILETRAIL_EVENT_BUFFER        Change notification buffer (default: 1000)
    FILETRAIL_ALLOWED_EXTENSIONS  Extensions accepted by add (default: txt,md,docx)
    RUST_LOG                      Log filter (default: info)

EXAMPLES:
    # Track a document
    filetrail add ~/notes/draft.md

    # Watch all tracked files until Ctrl+C
    filetrail run

    # Show the last five snapshots as JSON
    filetrail history ~/notes/draft.md --limit 5 --json
")]
struct Cli {
    /// Print results as a JSON `{error, data}` object.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile tracked files, then watch them until interrupted.
    Run,

    /// Reconcile and list tracked files.
    List,

    /// Start tracking a file.
    Add {
        /// File to track (txt, md or docx by default).
        path: PathBuf,
    },

    /// Stop tracking a file. Its history is kept.
    Remove {
        /// Tracked file to remove.
        path: PathBuf,
    },

    /// Print the recorded history of a file, most recent first.
    History {
        /// File whose history to print.
        path: PathBuf,

        /// Maximum number of records to print.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the current modification time of a file.
    LastModified {
        /// File to inspect.
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(registry = %config.registry_path.display(), "Configuration loaded");

    let monitor = Monitor::new(config);
    let json = cli.json;

    match cli.command {
        Command::Run => run_monitor(&monitor).await?,
        Command::List => {
            let result = monitor.list_tracked_files().await;
            print_result(json, result, |report| {
                for file in &report.verified {
                    println!("{}\t{}", to_iso8601(&file.modified_at), file.file_path.display());
                }
                for file in &report.not_found {
                    println!("missing\t{}", file.file_path.display());
                }
            })?;
        }
        Command::Add { path } => {
            let result = monitor.add_tracked_file(&path).await;
            print_result(json, result, |file| {
                println!("Tracking {}", file.file_path.display());
            })?;
        }
        Command::Remove { path } => {
            let result = monitor.remove_tracked_file(&path).await;
            print_result(json, result, |file| {
                println!("Stopped tracking {}", file.file_path.display());
            })?;
        }
        Command::History { path, limit } => {
            let result = monitor.history(&path).await.map(|mut records| {
                if let Some(limit) = limit {
                    records.truncate(limit);
                }
                records
            });
            print_result(json, result, |records| {
                for record in records {
                    println!("--- #{} {}", record.id, to_iso8601(&record.modified_time));
                    println!("{}", record.content);
                }
            })?;
        }
        Command::LastModified { path } => {
            let result = monitor.last_modified(&path).await.map(|ts| to_iso8601(&ts));
            print_result(json, result, |modified_at| println!("{modified_at}"))?;
        }
    }

    monitor.shutdown().await;
    Ok(())
}

/// Prints an operation's result, either as a `Reply` or through `human`.
fn print_result<T: Serialize>(
    json: bool,
    result: Result<T, MonitorError>,
    human: impl FnOnce(&T),
) -> Result<()> {
    if json {
        let reply = Reply::from(result);
        println!("{}", serde_json::to_string_pretty(&reply)?);
        return Ok(());
    }

    let value = result?;
    human(&value);
    Ok(())
}

/// Reconciles, starts the watchers and logs change events until shutdown.
async fn run_monitor(monitor: &Monitor) -> Result<()> {
    info!("Starting Filetrail Monitor");

    let mut events = monitor.subscribe();
    let report = monitor
        .list_tracked_files()
        .await
        .context("Failed to reconcile tracked files")?;

    for file in &report.not_found {
        warn!(path = %file.file_path.display(), "Tracked file not found, not watching");
    }
    info!(
        watching = report.verified.len(),
        missing = report.not_found.len(),
        "Monitor running"
    );

    let log_events = async {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change notifications dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        () = log_events => {},
        () = wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

fn log_event(event: &WatchEvent) {
    match event {
        WatchEvent::FileChanged {
            path,
            record_id,
            modified_time,
        } => info!(
            path = %path.display(),
            record_id,
            modified_time = %to_iso8601(modified_time),
            "File changed"
        ),
        WatchEvent::CaptureFailed { path, message } => {
            error!(path = %path.display(), error = %message, "Capture failed");
        }
        WatchEvent::OrderingAnomaly {
            path,
            previous,
            current,
        } => warn!(
            path = %path.display(),
            previous = %to_iso8601(previous),
            current = %to_iso8601(current),
            "History ordering anomaly"
        ),
    }
}

/// Initializes the tracing subscriber on stderr, keeping stdout for results.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
