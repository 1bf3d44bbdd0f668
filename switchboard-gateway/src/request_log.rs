//! # Request Log
//!
//! One JSON line per completed request, written under the configured log
//! directory with daily rotation, plus a bounded in-memory ring buffer of
//! the same records backing `/admin/jobs`.
//!
//! Retention is filename-based: rotated files carry a `YYYY-MM-DD` suffix
//! and anything older than `keep_days` is pruned when the log is opened.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use switchboard_core::job::AttemptRecord;
use switchboard_core::ErrorKind;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

const LOG_FILE_PREFIX: &str = "requests.jsonl";

/// One completed request, as it lands in the log file and the ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub ts: DateTime<Utc>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_name: Option<String>,
    pub queue_wait_ms: u64,
    pub runtime_ms: u64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

/// Rolling JSON-lines writer plus the ring buffer.
pub struct RequestLog {
    writer: Mutex<RollingFileAppender>,
    ring: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl RequestLog {
    /// Open the log under `dir`, pruning rotated files older than
    /// `keep_days`.
    pub fn open(dir: impl AsRef<Path>, keep_days: u32, capacity: usize) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        prune_old_files(dir, keep_days);
        let writer = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        Ok(Self {
            writer: Mutex::new(writer),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    /// Append one record to the file and the ring buffer.
    pub fn record(&self, record: RequestRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                let mut writer = self
                    .writer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Err(e) = writeln!(writer, "{line}") {
                    tracing::warn!(error = %e, "failed to append request log record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize request log record"),
        }

        let mut ring = self
            .ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        let ring = self
            .ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ring.iter().rev().take(limit).cloned().collect()
    }
}

fn prune_old_files(dir: &Path, keep_days: u32) {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(keep_days));
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(&format!("{LOG_FILE_PREFIX}.")) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(suffix, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = %name, error = %e, "failed to prune old request log");
            } else {
                tracing::debug!(file = %name, "pruned old request log");
            }
        }
    }
}
