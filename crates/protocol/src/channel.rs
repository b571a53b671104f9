//! Shared-memory command channel.
//!
//! One fixed-size segment holds exactly one [`Message`]; a cross-process
//! advisory file lock guards every copy in or out of it. The segment file
//! lives next to a `.lock` file; both are process-wide singletons for the
//! service's lifetime.
//!
//! The advisory lock only excludes other processes, so the channel pairs
//! it with an in-process mutex around the mapping. Lock hold time is one
//! slot copy.

use crate::message::{Command, FileInfo, Message, MsgKind, ProtocolError};
use fs2::FileExt as _;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default segment path for the fsentry channel.
pub const DEFAULT_SEGMENT_PATH: &str = "/run/fsentry/fsentry.shm";

/// Environment variable overriding the segment path.
pub const SEGMENT_ENV_VAR: &str = "FSENTRY_SEGMENT";

/// Shortest sleep between handshake polls.
pub const POLL_BACKOFF_MIN: Duration = Duration::from_micros(10);

/// Longest sleep between handshake polls.
pub const POLL_BACKOFF_MAX: Duration = Duration::from_millis(5);

/// Error type for channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// IO error on the segment or lock file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Slot contents failed to decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Existing segment file has the wrong size for this protocol.
    #[error("segment has wrong size: expected {expected} bytes, found {found}")]
    BadSegmentSize { expected: usize, found: u64 },

    /// The caller stopped polling before the peer freed the slot.
    #[error("channel polling cancelled")]
    Cancelled,
}

/// Resolve the segment path: `FSENTRY_SEGMENT` env var, else the default.
#[must_use]
pub fn segment_path() -> PathBuf {
    std::env::var(SEGMENT_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SEGMENT_PATH))
}

/// Resolve the segment path, using `XDG_RUNTIME_DIR` as fallback.
///
/// Resolution order:
/// 1. `FSENTRY_SEGMENT` environment variable
/// 2. `$XDG_RUNTIME_DIR/fsentry.shm` (if `XDG_RUNTIME_DIR` is set)
/// 3. Default: `/run/fsentry/fsentry.shm`
#[must_use]
pub fn segment_path_with_xdg_fallback() -> PathBuf {
    if let Ok(path) = std::env::var(SEGMENT_ENV_VAR) {
        return PathBuf::from(path);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("fsentry.shm");
    }
    PathBuf::from(DEFAULT_SEGMENT_PATH)
}

fn lock_path(segment: &Path) -> PathBuf {
    let mut path = segment.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(POLL_BACKOFF_MAX)
}

/// The shared single-slot channel: a mapped segment plus its lock pair.
pub struct IpcChannel {
    map: Mutex<MmapMut>,
    lock_file: File,
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("slot_len", &Message::ENCODED_LEN)
            .finish()
    }
}

impl IpcChannel {
    /// Create the segment (server side).
    ///
    /// The cross-process lock is held for the whole initialization and
    /// released only once the slot is zeroed, so a client attaching early
    /// never observes a half-built segment. Any failure here is fatal for
    /// startup.
    pub fn create(segment: &Path) -> Result<Self, ChannelError> {
        if let Some(parent) = segment.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(segment)?;
        file.set_len(Message::ENCODED_LEN as u64)?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(segment))?;

        lock_file.lock_exclusive()?;
        // SAFETY: the mapping is backed by a file we created with the exact
        // slot length and keep open for the channel's lifetime; all slot
        // access is serialized through the lock pair.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.fill(0);
        map.flush()?;
        lock_file.unlock()?;

        Ok(Self {
            map: Mutex::new(map),
            lock_file,
        })
    }

    /// Attach to an existing segment (client side, tests).
    pub fn open(segment: &Path) -> Result<Self, ChannelError> {
        let file = OpenOptions::new().read(true).write(true).open(segment)?;
        let found = file.metadata()?.len();
        if found != Message::ENCODED_LEN as u64 {
            return Err(ChannelError::BadSegmentSize {
                expected: Message::ENCODED_LEN,
                found,
            });
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(segment))?;
        // SAFETY: see `create`; the size check above pins the mapped extent.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map: Mutex::new(map),
            lock_file,
        })
    }

    /// Atomically copy a message into the slot.
    pub fn write_message(
        &self,
        kind: MsgKind,
        command: Command,
        info: &FileInfo,
    ) -> Result<(), ChannelError> {
        let bytes = Message::new(kind, command, info.clone()).to_bytes()?;
        let mut map = self.map.lock();
        self.lock_file.lock_exclusive()?;
        map[..Message::ENCODED_LEN].copy_from_slice(&bytes);
        self.lock_file.unlock()?;
        Ok(())
    }

    /// Atomically copy the current message out of the slot.
    pub fn read_current(&self) -> Result<Message, ChannelError> {
        let mut bytes = [0u8; Message::ENCODED_LEN];
        {
            let map = self.map.lock();
            self.lock_file.lock_exclusive()?;
            bytes.copy_from_slice(&map[..Message::ENCODED_LEN]);
            self.lock_file.unlock()?;
        }
        Ok(Message::from_bytes(&bytes)?)
    }

    /// Server-side blocking send: wait for the client to consume the
    /// previous response, then write this one.
    ///
    /// Polls with exponential backoff. `keep_polling` is checked between
    /// polls so shutdown is not wedged by an absent client.
    pub fn send(
        &self,
        command: Command,
        info: &FileInfo,
        keep_polling: impl Fn() -> bool,
    ) -> Result<(), ChannelError> {
        let mut backoff = POLL_BACKOFF_MIN;
        while self.read_current()?.kind == MsgKind::Response {
            if !keep_polling() {
                return Err(ChannelError::Cancelled);
            }
            std::thread::sleep(backoff);
            backoff = next_backoff(backoff);
        }
        self.write_message(MsgKind::Response, command, info)
    }
}

/// Error type for client requests.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Server rejected the request argument.
    #[error("request argument rejected by the server")]
    BadArgument,

    /// Server hit an internal failure while dispatching.
    #[error("server error while dispatching the request")]
    Server,

    /// Response carried a command that is not a valid reply.
    #[error("unexpected reply command: {0:?}")]
    UnexpectedReply(Command),

    /// No terminal response arrived in time.
    #[error("timed out waiting for a response")]
    TimedOut,
}

/// Client-side view of the channel: one request, one response stream.
#[derive(Debug)]
pub struct IpcClient {
    channel: IpcChannel,
}

impl IpcClient {
    /// Attach to the server's segment.
    pub fn connect(segment: &Path) -> Result<Self, ChannelError> {
        Ok(Self {
            channel: IpcChannel::open(segment)?,
        })
    }

    /// Issue one request and collect its full response stream.
    ///
    /// Streamed replies return the `Continue` payloads in order; a single
    /// `None` reply carrying a non-empty payload (a `Search` hit) returns
    /// that payload alone. Each consumed response frees the slot for the
    /// server's next write.
    pub fn request(
        &self,
        command: Command,
        info: &FileInfo,
        timeout: Duration,
    ) -> Result<Vec<FileInfo>, ClientError> {
        let deadline = Instant::now() + timeout;
        self.wait_slot_free(deadline)?;
        self.channel
            .write_message(MsgKind::Request, command, info)?;

        let mut items = Vec::new();
        let mut backoff = POLL_BACKOFF_MIN;
        loop {
            let msg = self.channel.read_current()?;
            if msg.kind != MsgKind::Response {
                if Instant::now() >= deadline {
                    return Err(ClientError::TimedOut);
                }
                std::thread::sleep(backoff);
                backoff = next_backoff(backoff);
                continue;
            }
            // Mark the slot consumed before acting on the payload; the
            // server will not overwrite an unconsumed response.
            self.channel
                .write_message(MsgKind::Empty, Command::None, &FileInfo::empty())?;
            backoff = POLL_BACKOFF_MIN;
            match msg.command {
                Command::Continue => items.push(msg.info),
                Command::None => {
                    if items.is_empty() && !msg.info.is_empty_path() {
                        items.push(msg.info);
                    }
                    return Ok(items);
                }
                Command::ErrorBadArg => return Err(ClientError::BadArgument),
                Command::Error => return Err(ClientError::Server),
                other => return Err(ClientError::UnexpectedReply(other)),
            }
        }
    }

    fn wait_slot_free(&self, deadline: Instant) -> Result<(), ClientError> {
        let mut backoff = POLL_BACKOFF_MIN;
        while self.channel.read_current()?.kind != MsgKind::Empty {
            if Instant::now() >= deadline {
                return Err(ClientError::TimedOut);
            }
            std::thread::sleep(backoff);
            backoff = next_backoff(backoff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn segment_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.shm");
        (dir, path)
    }

    fn info_for(path: &str) -> FileInfo {
        let mut info = FileInfo::empty();
        info.path = PathBuf::from(path);
        info.size = 10;
        info
    }

    #[test]
    fn test_create_zeroes_slot() {
        let (_dir, path) = segment_file();
        let channel = IpcChannel::create(&path).unwrap();
        let msg = channel.read_current().unwrap();
        assert_eq!(msg.kind, MsgKind::Empty);
        assert_eq!(msg.command, Command::None);
    }

    #[test]
    fn test_create_rezeroes_stale_segment() {
        let (_dir, path) = segment_file();
        {
            let channel = IpcChannel::create(&path).unwrap();
            channel
                .write_message(MsgKind::Response, Command::Continue, &info_for("/stale"))
                .unwrap();
        }
        let channel = IpcChannel::create(&path).unwrap();
        assert_eq!(channel.read_current().unwrap().kind, MsgKind::Empty);
    }

    #[test]
    fn test_open_rejects_wrong_size() {
        let (_dir, path) = segment_file();
        std::fs::write(&path, b"too small").unwrap();
        let err = IpcChannel::open(&path).unwrap_err();
        assert!(matches!(err, ChannelError::BadSegmentSize { .. }));
    }

    #[test]
    fn test_write_read_through_two_handles() {
        let (_dir, path) = segment_file();
        let server = IpcChannel::create(&path).unwrap();
        let client = IpcChannel::open(&path).unwrap();

        let info = info_for("/srv/data/x.bin");
        client
            .write_message(MsgKind::Request, Command::Search, &info)
            .unwrap();

        let seen = server.read_current().unwrap();
        assert_eq!(seen.kind, MsgKind::Request);
        assert_eq!(seen.command, Command::Search);
        assert_eq!(seen.info, info);
    }

    #[test]
    fn test_send_waits_for_consumption() {
        let (_dir, path) = segment_file();
        let server = std::sync::Arc::new(IpcChannel::create(&path).unwrap());
        // Slot already holds an unconsumed response.
        server
            .write_message(MsgKind::Response, Command::Continue, &info_for("/first"))
            .unwrap();

        let consumer = IpcChannel::open(&path).unwrap();
        let server2 = std::sync::Arc::clone(&server);
        let sender = std::thread::spawn(move || {
            server2.send(Command::None, &FileInfo::empty(), || true)
        });

        // Give the sender time to start polling, then consume.
        std::thread::sleep(Duration::from_millis(20));
        let first = consumer.read_current().unwrap();
        assert_eq!(first.info.path, PathBuf::from("/first"));
        consumer
            .write_message(MsgKind::Empty, Command::None, &FileInfo::empty())
            .unwrap();

        sender.join().unwrap().unwrap();
        let second = consumer.read_current().unwrap();
        assert_eq!(second.kind, MsgKind::Response);
        assert_eq!(second.command, Command::None);
    }

    #[test]
    fn test_send_cancelled_when_polling_stops() {
        let (_dir, path) = segment_file();
        let server = IpcChannel::create(&path).unwrap();
        server
            .write_message(MsgKind::Response, Command::Continue, &info_for("/stuck"))
            .unwrap();
        let err = server
            .send(Command::None, &FileInfo::empty(), || false)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled));
    }

    #[test]
    fn test_client_times_out_without_server() {
        let (_dir, path) = segment_file();
        let _server = IpcChannel::create(&path).unwrap();
        let client = IpcClient::connect(&path).unwrap();
        let err = client
            .request(
                Command::GetAllFiles,
                &FileInfo::empty(),
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::TimedOut));
    }
}
