//! The failure logger: one JSON file per poll or write failure, written
//! under `polling_failures/YYYYMMDD/{plc}_failure_{HHMMSS}_{ms}.log`.
//!
//! The reaper that deletes files older than 30 days is invoked by the
//! control surface, never automatically (spec §4.12).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum FailureLogError {
    #[error("failed to create failure log directory {0:?}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to write failure log file {0:?}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to serialize failure entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ConnectionFailed,
    ReadError,
    Timeout,
    WriteError,
    DataCorruption,
    CustomError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub plc_code: String,
    pub group_name: String,
    pub error_type: ErrorType,
    pub error_message: String,
    pub tag_addresses: Vec<String>,
    pub tag_count: usize,
    pub poll_duration_ms: u64,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Writes one JSON file per failure under a dated subdirectory of `root`.
pub struct FailureLogger {
    root: PathBuf,
}

impl FailureLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write one failure as its own JSON file. The filename embeds the
    /// millisecond so two failures for the same PLC in the same second
    /// never collide.
    pub async fn log(&self, entry: &FailureEntry) -> Result<PathBuf, FailureLogError> {
        let day_dir = self.root.join(entry.timestamp.format("%Y%m%d").to_string());
        tokio::fs::create_dir_all(&day_dir)
            .await
            .map_err(|e| FailureLogError::CreateDir(day_dir.clone(), e))?;

        let file_name = format!(
            "{}_failure_{}_{:03}.log",
            entry.plc_code,
            entry.timestamp.format("%H%M%S"),
            entry.timestamp.timestamp_subsec_millis(),
        );
        let path = day_dir.join(file_name);

        let body = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| FailureLogError::Write(path.clone(), e))?;

        debug!(path = %path.display(), "wrote failure log");
        Ok(path)
    }

    /// Delete failure-log files older than 30 days. Called only from the
    /// control surface's `reap_old_failures` operation, never on a timer.
    pub async fn reap_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0usize;

        let mut day_dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        while let Ok(Some(day_entry)) = day_dirs.next_entry().await {
            let day_path = day_entry.path();
            let Some(day_name) = day_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(day) = chrono::NaiveDate::parse_from_str(day_name, "%Y%m%d") else {
                continue;
            };
            let day_end = day.and_hms_opt(23, 59, 59).unwrap().and_utc();
            if day_end >= cutoff {
                continue;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&day_path).await {
                error!(path = %day_path.display(), error = %e, "failed to reap old failure log directory");
                continue;
            }
            removed += 1;
        }
        removed
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
