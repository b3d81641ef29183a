//! File logging for the layer.
//!
//! The layer lives inside someone else's process and has no console, so every
//! `log` record is routed into a per-day file under the user's local data
//! directory. Old files are pruned on start.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;

use crate::error::{LayerResult, OptionExt, ResultExt};

/// Maximum number of log files to keep
const MAX_LOG_FILES: usize = 5;

/// File name prefix of the log files
const LOG_PREFIX: &str = "quadviews";

lazy_static::lazy_static! {
    /// Log directory path, set once the logger is installed
    static ref LOG_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

/// Default log directory (`<local data>/QuadViews/logs`).
pub fn default_log_dir() -> LayerResult<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("QuadViews").join("logs"))
        .context("no local data directory for this user")
}

/// Initialize the logging system.
///
/// Installs an `env_logger` writing to today's log file. `RUST_LOG` overrides
/// the default `info` filter. Calling this again after a successful
/// initialization is a no-op and returns the directory already in use.
pub fn init_logging(log_dir: Option<&Path>) -> LayerResult<PathBuf> {
    let mut current = LOG_DIR.lock();
    if let Some(dir) = current.as_ref() {
        return Ok(dir.clone());
    }

    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let log_file_path = get_current_log_path(&log_dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
        .context("failed to install logger")?;

    *current = Some(log_dir.clone());
    drop(current);

    log::info!("[LOGGING] Logging system initialized");
    log::info!("[LOGGING] Log directory: {:?}", log_dir);

    cleanup_old_logs(&log_dir);

    Ok(log_dir)
}

/// The directory in use, if logging was initialized.
pub fn log_dir() -> Option<PathBuf> {
    LOG_DIR.lock().clone()
}

/// Get the path for the current log file (one per day)
fn get_current_log_path(log_dir: &Path) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d");
    log_dir.join(format!("{}_{}.log", LOG_PREFIX, date))
}

/// Clean up old log files, keeping only the most recent MAX_LOG_FILES
fn cleanup_old_logs(log_dir: &Path) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let path = e.path();
                path.extension().map(|ext| ext == "log").unwrap_or(false)
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with(LOG_PREFIX))
                        .unwrap_or(false)
            })
            .collect();

        // Newest first; names embed the date so they sort chronologically
        log_files.sort_by_key(|e| std::cmp::Reverse(e.file_name()));

        for file in log_files.into_iter().skip(MAX_LOG_FILES) {
            if let Err(e) = fs::remove_file(file.path()) {
                log::warn!("[LOGGING] Failed to remove {:?}: {}", file.path(), e);
            }
        }
    }
}
