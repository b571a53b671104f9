//! Change processing: validate an observed event against the store,
//! append it to the history, and optionally emit one audit-log line.

use crate::store::SharedStore;
use chrono::DateTime;
use fsentry_protocol::FileInfo;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;

/// Append-only JSON-lines audit log, flushed after every record.
pub struct AuditLog {
    out: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the log file for appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(file),
        })
    }

    /// Write one change record as a single JSON line.
    pub fn append(&self, info: &FileInfo) -> std::io::Result<()> {
        let line = serde_json::to_string(&audit_record(info))?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()
    }
}

fn audit_record(info: &FileInfo) -> serde_json::Value {
    serde_json::json!({
        "path": info.path.display().to_string(),
        "file size": info.size,
        "attribute": info.attributes.bits(),
        "links": info.links,
        "creation time": format_time(info.created),
        "last access time": format_time(info.accessed),
        "last write time": format_time(info.modified),
        "change": info.change.as_action(),
        "change time": format_time(info.change_time),
    })
}

fn format_time(unix_secs: i64) -> String {
    DateTime::from_timestamp(unix_secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Validates observed changes and records the qualifying ones.
pub struct ChangeProcessor {
    store: SharedStore,
    audit: Option<AuditLog>,
}

impl ChangeProcessor {
    pub fn new(store: SharedStore, audit: Option<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Record one observed change.
    ///
    /// Events for paths the store does not track are dropped silently;
    /// this covers files deleted between notification and processing as
    /// well as files that were never tracked. The store lock is held only
    /// for the check-and-append.
    pub fn process(&self, info: &FileInfo) {
        {
            let mut store = self.store.lock();
            if !store.is_file_tracked(&info.path) {
                tracing::trace!(path = %info.path.display(), "change for untracked path dropped");
                return;
            }
            store.add_to_history(info.clone());
        }
        tracing::debug!(
            path = %info.path.display(),
            change = ?info.change,
            "change recorded"
        );
        if let Some(audit) = &self.audit
            && let Err(e) = audit.append(info)
        {
            tracing::warn!(error = %e, "failed to write audit log line");
        }
    }
}
