//! Server side of the shared-memory command protocol.
//!
//! One blocking loop: read the slot, act on a pending request, answer with
//! one or more responses, sleep, repeat. List-valued results are streamed
//! as `Continue` messages followed by one terminating `None`. All store
//! access goes through the shared store lock, held per store call and
//! never across a channel write.

use crate::registry::{WatchRegistry, WatcherContext};
use crate::signals::ServiceStatus;
use crate::store::SharedStore;
use fsentry_protocol::{ChannelError, Command, FileInfo, IpcChannel, Message, MsgKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for the dispatch loop. Any of these is fatal for the IPC
/// side of the service; watcher tasks are unaffected.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport failure on the shared slot.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Drives request dispatch against the store and the watch registry.
pub struct CommandDispatcher {
    channel: Arc<IpcChannel>,
    store: SharedStore,
    registry: Arc<WatchRegistry>,
    ctx: Arc<WatcherContext>,
    cycle: Duration,
}

impl CommandDispatcher {
    pub fn new(
        channel: Arc<IpcChannel>,
        store: SharedStore,
        registry: Arc<WatchRegistry>,
        ctx: Arc<WatcherContext>,
        cycle: Duration,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
            ctx,
            cycle,
        }
    }

    /// Run the dispatch loop until shutdown or a fatal failure.
    ///
    /// On failure the client gets one best-effort `Error` response before
    /// the error propagates.
    pub fn run(&self) -> Result<(), DispatchError> {
        tracing::info!("command dispatcher started");
        let result = self.run_inner();
        if let Err(e) = &result {
            tracing::error!(error = %e, "dispatch failed");
            let _ = self
                .channel
                .write_message(MsgKind::Response, Command::Error, &FileInfo::empty());
        }
        self.ctx.signals.report(ServiceStatus::StopPending);
        tracing::info!("command dispatcher stopped");
        result
    }

    fn run_inner(&self) -> Result<(), DispatchError> {
        let signals = &self.ctx.signals;
        while signals.is_running() {
            signals.report(ServiceStatus::Running);
            while signals.is_paused() {
                std::thread::sleep(self.ctx.intervals.pause_poll);
                if !signals.is_running() {
                    return Ok(());
                }
            }
            let msg = self.channel.read_current()?;
            if msg.kind == MsgKind::Request {
                match self.dispatch(&msg) {
                    Ok(()) => {}
                    // A send interrupted by shutdown is a clean exit.
                    Err(DispatchError::Channel(ChannelError::Cancelled))
                        if !signals.is_running() =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            std::thread::sleep(self.cycle);
        }
        Ok(())
    }

    fn dispatch(&self, msg: &Message) -> Result<(), DispatchError> {
        tracing::debug!(command = ?msg.command, path = %msg.info.path.display(), "request");
        match msg.command {
            Command::Insert => {
                // The argument must resolve to a real, stat-able entry
                // before the store is touched.
                match FileInfo::from_path(&msg.info.path) {
                    Ok(info) => {
                        self.store.lock().insert_file(info);
                        self.send(Command::None, &FileInfo::empty())
                    }
                    Err(e) => {
                        tracing::debug!(
                            path = %msg.info.path.display(),
                            error = %e,
                            "insert argument rejected"
                        );
                        self.send(Command::ErrorBadArg, &FileInfo::empty())
                    }
                }
            }
            Command::InsertDir => {
                let path = msg.info.path.clone();
                self.store.lock().insert_dir(&path);
                self.registry.add(path, Arc::clone(&self.ctx));
                self.send(Command::None, &FileInfo::empty())
            }
            Command::Remove => {
                self.store.lock().remove(&msg.info.path);
                self.registry.remove(&msg.info.path);
                self.send(Command::None, &FileInfo::empty())
            }
            Command::History => {
                let items = self.store.lock().history(&msg.info.path);
                self.stream(items)
            }
            Command::Search => {
                let found = self.store.lock().search_by_path(&msg.info.path);
                self.send(Command::None, &found.unwrap_or_else(FileInfo::empty))
            }
            Command::SearchByName => {
                // The path buffer carries the bare file name for this one.
                let name = msg.info.path.to_string_lossy().into_owned();
                let items = self.store.lock().search_by_name(&name);
                self.stream(items)
            }
            Command::ClearHistory => {
                if msg.info.is_empty_path() {
                    self.store.lock().clear_all_history();
                } else {
                    self.store.lock().clear_history(&msg.info.path);
                }
                self.send(Command::None, &FileInfo::empty())
            }
            Command::GetFilesFromDir => {
                let items = self.store.lock().files_from_dir(&msg.info.path);
                self.stream(items)
            }
            Command::GetAllFiles => {
                let items = self.store.lock().all_files();
                self.stream(items)
            }
            // Control tags are not requests; leave the slot alone.
            Command::None
            | Command::Continue
            | Command::Error
            | Command::ErrorBadArg => Ok(()),
        }
    }

    fn stream(&self, items: Vec<FileInfo>) -> Result<(), DispatchError> {
        for item in &items {
            self.send(Command::Continue, item)?;
        }
        self.send(Command::None, &FileInfo::empty())
    }

    fn send(&self, command: Command, info: &FileInfo) -> Result<(), DispatchError> {
        let signals = Arc::clone(&self.ctx.signals);
        self.channel
            .send(command, info, move || signals.is_running())
            .map_err(Into::into)
    }
}
