//! Status Log - Nhật ký chuyển trạng thái
//!
//! Append-only text log, one line per trust transition edge
//! (good -> bad, bad -> good). Read by operators, never parsed back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// EVENT
// ============================================================================

/// Direction of a logged transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusChange {
    Abnormal,
    Recovered,
}

impl StatusChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusChange::Abnormal => "abnormal detected",
            StatusChange::Recovered => "recovered",
        }
    }
}

/// One status-log entry
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub change: StatusChange,
    /// Host number, "?" in the line when unknown
    pub host: Option<u32>,
    pub sent: u64,
    pub drop_rate: f64,
    pub drop_count: u64,
}

impl StatusEvent {
    fn to_line(&self) -> String {
        let host = self.host.map(|h| h.to_string()).unwrap_or_else(|| "?".to_string());
        format!(
            "{}  host {} {} --- sent {}  drop rate {:.4}  drop count {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            host,
            self.change.as_str(),
            self.sent,
            self.drop_rate,
            self.drop_count
        )
    }
}

// ============================================================================
// LOG
// ============================================================================

/// Append-only status log
pub struct StatusLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    events: AtomicU64,
}

impl StatusLog {
    /// Lazily opened on the first event
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
            events: AtomicU64::new(0),
        }
    }

    fn open(path: &Path) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::info!("Opened status log: {:?}", path);
        Ok(BufWriter::new(file))
    }

    pub fn record(&self, event: &StatusEvent) -> std::io::Result<()> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(Self::open(&self.path)?);
        }

        if let Some(writer) = guard.as_mut() {
            writer.write_all(event.to_line().as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        self.events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Record, logging instead of failing
    pub fn record_or_log(&self, event: &StatusEvent) {
        if let Err(e) = self.record(event) {
            log::error!("Failed to write status log {:?}: {}", self.path, e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events_recorded(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }
}
