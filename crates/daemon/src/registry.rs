//! The authoritative set of watched directories.
//!
//! A path is watched iff the registry holds an entry for it, and each entry
//! owns the join handle of its watcher task. Removing an entry is the only
//! per-path cancellation signal: the task polls `contains` and exits on its
//! own. Shutdown joins every remaining handle so no task is leaked.

use crate::config::WatchIntervals;
use crate::processor::ChangeProcessor;
use crate::signals::ServiceSignals;
use crate::watcher;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything a watcher task needs besides its path.
pub struct WatcherContext {
    /// Shared run/pause flags.
    pub signals: Arc<ServiceSignals>,
    /// Sink for decoded change events.
    pub processor: Arc<ChangeProcessor>,
    /// Loop timing.
    pub intervals: WatchIntervals,
}

/// Concurrent map of watched path to watcher task handle.
pub struct WatchRegistry {
    watchers: RwLock<HashMap<PathBuf, JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
}

impl WatchRegistry {
    /// `runtime` is where watcher tasks are spawned; keeping it explicit
    /// lets `add` be called from blocking threads (the dispatcher).
    #[must_use]
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    /// Whether `path` is currently watched. Watcher tasks poll this to
    /// decide whether to keep running.
    pub fn contains(&self, path: &Path) -> bool {
        self.watchers.read().contains_key(path)
    }

    /// Currently watched paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.watchers.read().keys().cloned().collect()
    }

    /// Start watching `path`. No-op if it is already watched.
    ///
    /// The task is detached from the caller's point of view; the registry
    /// keeps the handle for shutdown.
    pub fn add(self: &Arc<Self>, path: PathBuf, ctx: Arc<WatcherContext>) -> bool {
        let mut watchers = self.watchers.write();
        if watchers.contains_key(&path) {
            return false;
        }
        let handle = self
            .runtime
            .spawn(watcher::run(path.clone(), Arc::clone(self), ctx));
        watchers.insert(path, handle);
        true
    }

    /// Stop watching `path`.
    ///
    /// Only the entry is removed; the watcher task notices at its next
    /// loop iteration and exits. The returned handle lets callers await
    /// that exit when they care.
    pub fn remove(&self, path: &Path) -> Option<JoinHandle<()>> {
        self.watchers.write().remove(path)
    }

    /// Join every remaining watcher task. Call after the running flag has
    /// been cleared; each task exits within one poll interval.
    pub async fn shutdown(&self) {
        let drained: Vec<(PathBuf, JoinHandle<()>)> =
            self.watchers.write().drain().collect();
        for (path, handle) in drained {
            if let Err(e) = handle.await {
                tracing::warn!(path = %path.display(), error = %e, "watcher task panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, path: &Path) {
        let handle = self.runtime.spawn(async {});
        self.watchers.write().insert(path.to_path_buf(), handle);
    }
}
