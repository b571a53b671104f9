//! Service lifecycle flags shared by every task.
//!
//! Watchers and the dispatcher poll these between loop iterations; nothing
//! is interrupted mid-operation, so pause and shutdown latency is bounded
//! by the poll intervals.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Coarse service state reported to the hosting environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Dispatch loop is cycling.
    Running,
    /// Dispatch loop is on its way out.
    StopPending,
}

type StatusHook = Box<dyn Fn(ServiceStatus) + Send + Sync>;

/// Shared running/paused flags plus an optional status-report callback.
pub struct ServiceSignals {
    running: AtomicBool,
    paused: AtomicBool,
    status_hook: Mutex<Option<StatusHook>>,
}

impl ServiceSignals {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            status_hook: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Ask every task to wind down at its next poll.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Install the status-report callback.
    pub fn set_status_hook(&self, hook: StatusHook) {
        *self.status_hook.lock() = Some(hook);
    }

    /// Report current status through the callback, if one is installed.
    pub fn report(&self, status: ServiceStatus) {
        if let Some(hook) = self.status_hook.lock().as_ref() {
            hook(status);
        }
    }
}

impl Default for ServiceSignals {
    fn default() -> Self {
        Self::new()
    }
}
