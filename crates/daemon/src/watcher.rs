//! Per-directory watcher tasks.
//!
//! Each watched directory gets one detached task that blocks on the watch
//! primitive for the next batch of raw change records, decodes the batch,
//! and hands each qualifying event to the change processor. The task keeps
//! running while its path stays in the registry and the service is up; it
//! observes removal and shutdown at its next loop iteration.

use crate::registry::{WatchRegistry, WatcherContext};
use fsentry_protocol::{ChangeKind, FileInfo, RecordBatch, decode_records, now_unix_secs};
use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound for one raw batch buffer.
const MAX_BATCH_BYTES: usize = 1024;

/// Map a notify event kind to the wire change kind.
///
/// `None` means the event carries nothing this service records (access
/// events, catch-all "other" events).
fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Modify(modify_kind) => match modify_kind {
            ModifyKind::Name(RenameMode::From) => Some(ChangeKind::RenamedFrom),
            ModifyKind::Name(RenameMode::To) => Some(ChangeKind::RenamedTo),
            _ => Some(ChangeKind::Modified),
        },
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => None,
    }
}

/// Source of raw change-record batches for one directory.
pub(crate) trait BatchSource: Send {
    /// Wait up to `wait` for activity and return the next raw batch.
    /// An empty buffer means "nothing happened".
    async fn next_batch(&mut self, wait: Duration) -> Vec<u8>;
}

/// Production [`BatchSource`] backed by the `notify` watch primitive.
///
/// The OS watcher pushes events into a channel; `next_batch` drains one
/// burst and encodes it as a raw record batch with names relative to the
/// watched directory.
pub(crate) struct NotifyBatchSource {
    // Dropping the watcher releases the OS watch handle.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Event>,
    base: PathBuf,
}

impl NotifyBatchSource {
    pub(crate) fn new(base: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => {
                    tracing::error!(error = %e, "watch error");
                }
            },
        )?;
        watcher.watch(base, RecursiveMode::Recursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
            base: base.to_path_buf(),
        })
    }

    fn encode_event(&self, batch: &mut RecordBatch, event: &notify::Event) {
        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
            // A paired rename carries both names in one event.
            if let [from, to] = event.paths.as_slice() {
                self.push_record(batch, from, ChangeKind::RenamedFrom);
                self.push_record(batch, to, ChangeKind::RenamedTo);
                return;
            }
        }
        let Some(kind) = map_event_kind(&event.kind) else {
            return;
        };
        for path in &event.paths {
            self.push_record(batch, path, kind);
        }
    }

    fn push_record(&self, batch: &mut RecordBatch, path: &Path, kind: ChangeKind) {
        let Ok(rel) = path.strip_prefix(&self.base) else {
            return;
        };
        let Some(name) = rel.to_str() else {
            return;
        };
        if name.is_empty() {
            return;
        }
        batch.push(name, kind);
    }
}

impl BatchSource for NotifyBatchSource {
    async fn next_batch(&mut self, wait: Duration) -> Vec<u8> {
        let first = match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(event)) => event,
            // Channel closed or nothing happened within the window.
            Ok(None) | Err(_) => return Vec::new(),
        };
        let mut batch = RecordBatch::new();
        self.encode_event(&mut batch, &first);
        while batch.len() < MAX_BATCH_BYTES {
            match self.rx.try_recv() {
                Ok(event) => self.encode_event(&mut batch, &event),
                Err(_) => break,
            }
        }
        batch.into_bytes()
    }
}

/// Entry point of one watcher task.
pub(crate) async fn run(path: PathBuf, registry: Arc<WatchRegistry>, ctx: Arc<WatcherContext>) {
    let source = match NotifyBatchSource::new(&path) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to start directory watch");
            registry.remove(&path);
            return;
        }
    };
    tracing::info!(path = %path.display(), "watcher started");
    run_loop(source, &path, &registry, &ctx).await;
    tracing::info!(path = %path.display(), "watcher stopped");
}

async fn run_loop<S: BatchSource>(
    mut source: S,
    path: &Path,
    registry: &WatchRegistry,
    ctx: &WatcherContext,
) {
    let intervals = ctx.intervals;
    while ctx.signals.is_running() && registry.contains(path) {
        while ctx.signals.is_paused() {
            tokio::time::sleep(intervals.pause_poll).await;
            if !ctx.signals.is_running() {
                return;
            }
        }
        let batch = source.next_batch(intervals.batch_wait).await;
        for (abs_path, kind) in decode_records(&batch, path) {
            // Snapshot fails when the entry vanished between notification
            // and processing; the event is dropped, not an error.
            let info = match FileInfo::from_path(&abs_path) {
                Ok(info) => info.with_change(kind, now_unix_secs()),
                Err(e) => {
                    tracing::trace!(path = %abs_path.display(), error = %e, "event dropped");
                    continue;
                }
            };
            ctx.processor.process(&info);
        }
        tokio::time::sleep(intervals.batch_delay).await;
    }
}
