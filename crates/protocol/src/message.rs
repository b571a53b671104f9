//! IPC message types exchanged through the shared-memory slot.
//!
//! Everything here has a fixed little-endian layout so a whole [`Message`]
//! can be copied byte-for-byte across the segment. No pointers, no
//! variable-length fields: the path lives in a bounded buffer.

use crate::record::ChangeKind;
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum number of UTF-8 bytes a path may occupy on the wire.
pub const MAX_PATH_BYTES: usize = 512;

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Path exceeds [`MAX_PATH_BYTES`] when encoded.
    #[error("path too long: {0} bytes (max {MAX_PATH_BYTES})")]
    PathTooLong(usize),

    /// Path is not valid UTF-8 and cannot cross the segment.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    /// Buffer too small to hold an encoded value.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Unknown discriminator value in the slot.
    #[error("unknown message kind: {0}")]
    UnknownKind(u32),

    /// Unknown command tag in the slot.
    #[error("unknown command: {0}")]
    UnknownCommand(u32),

    /// IO error while inspecting a filesystem entry.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Attribute bits carried in a [`FileInfo`].
    ///
    /// Bit positions match the Win32 file attribute constants so the values
    /// stay meaningful to clients that log or display them numerically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        /// Entry is read-only.
        const READONLY = 0x0000_0001;
        /// Entry is hidden (dot-file on Unix).
        const HIDDEN = 0x0000_0002;
        /// Entry belongs to the operating system.
        const SYSTEM = 0x0000_0004;
        /// Entry is a directory.
        const DIRECTORY = 0x0000_0010;
        /// Entry is marked for archival.
        const ARCHIVE = 0x0000_0020;
        /// Entry is a symbolic link (reparse point).
        const SYMLINK = 0x0000_0400;
    }
}

impl FileAttributes {
    /// Derive attribute bits from filesystem metadata.
    pub fn from_metadata(path: &Path, meta: &std::fs::Metadata) -> Self {
        let mut attrs = Self::empty();
        if meta.is_dir() {
            attrs |= Self::DIRECTORY;
        }
        if meta.file_type().is_symlink() {
            attrs |= Self::SYMLINK;
        }
        if meta.permissions().readonly() {
            attrs |= Self::READONLY;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            attrs |= Self::HIDDEN;
        }
        attrs
    }
}

/// Message discriminator: who wrote the slot last, and is it consumed.
///
/// The handshake of the whole protocol rides on this field: the client
/// writes `Request`, the server answers with `Response`, and the client
/// marks the slot `Empty` once it has copied a response out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    /// Slot is free (zeroed at startup, or last response consumed).
    Empty = 0,
    /// Slot holds a client request not yet acted on.
    Request = 1,
    /// Slot holds a server response not yet consumed.
    Response = 2,
}

impl TryFrom<u32> for MsgKind {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Closed command enumeration shared by requests and responses.
///
/// `Continue` marks one element of a multi-value response stream; `None`
/// is the stream terminator and also the reply to commands with no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// No-op / end-of-stream / "accepted with empty result".
    None = 0,
    /// Start tracking a file.
    Insert = 1,
    /// Start tracking (and watching) a directory.
    InsertDir = 2,
    /// Stop tracking a path.
    Remove = 3,
    /// Fetch the change history of a path.
    History = 4,
    /// Look up one tracked file by exact path.
    Search = 5,
    /// Look up tracked files by file name.
    SearchByName = 6,
    /// Clear history, either globally or for one path.
    ClearHistory = 7,
    /// List tracked files under a directory.
    GetFilesFromDir = 8,
    /// List every tracked file.
    GetAllFiles = 9,
    /// One element of a streamed response.
    Continue = 10,
    /// Server-side failure while dispatching.
    Error = 11,
    /// Request argument did not resolve to a usable file.
    ErrorBadArg = 12,
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Insert),
            2 => Ok(Self::InsertDir),
            3 => Ok(Self::Remove),
            4 => Ok(Self::History),
            5 => Ok(Self::Search),
            6 => Ok(Self::SearchByName),
            7 => Ok(Self::ClearHistory),
            8 => Ok(Self::GetFilesFromDir),
            9 => Ok(Self::GetAllFiles),
            10 => Ok(Self::Continue),
            11 => Ok(Self::Error),
            12 => Ok(Self::ErrorBadArg),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Identity and metadata snapshot of one filesystem entry.
///
/// Produced fresh on every observed change and every query response, never
/// mutated afterwards, and copied by value through the shared segment.
/// Timestamps are Unix seconds; `change` is [`ChangeKind::None`] unless the
/// snapshot was taken for an observed change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute path of the entry. Must encode to UTF-8 within
    /// [`MAX_PATH_BYTES`] bytes or encoding fails.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Attribute bits, see [`FileAttributes`].
    pub attributes: FileAttributes,
    /// Hard-link count.
    pub links: u32,
    /// Creation time (falls back to 0 where the filesystem has none).
    pub created: i64,
    /// Last access time.
    pub accessed: i64,
    /// Last write time.
    pub modified: i64,
    /// Kind of the observed change, if any.
    pub change: ChangeKind,
    /// When the change was observed.
    pub change_time: i64,
}

const PATH_LEN_OFF: usize = 0;
const PATH_OFF: usize = 2;
const SIZE_OFF: usize = PATH_OFF + MAX_PATH_BYTES;
const ATTR_OFF: usize = SIZE_OFF + 8;
const LINKS_OFF: usize = ATTR_OFF + 4;
const CREATED_OFF: usize = LINKS_OFF + 4;
const ACCESSED_OFF: usize = CREATED_OFF + 8;
const MODIFIED_OFF: usize = ACCESSED_OFF + 8;
const CHANGE_OFF: usize = MODIFIED_OFF + 8;
const CHANGE_TIME_OFF: usize = CHANGE_OFF + 4;

fn unix_secs(time: std::io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time as Unix seconds.
pub fn now_unix_secs() -> i64 {
    unix_secs(Ok(SystemTime::now()))
}

impl FileInfo {
    /// Encoded size of one `FileInfo` on the wire.
    pub const ENCODED_LEN: usize = CHANGE_TIME_OFF + 8;

    /// An all-zero snapshot: empty path, no change. Used as the payload of
    /// control responses.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            path: PathBuf::new(),
            size: 0,
            attributes: FileAttributes::empty(),
            links: 0,
            created: 0,
            accessed: 0,
            modified: 0,
            change: ChangeKind::None,
            change_time: 0,
        }
    }

    /// Snapshot a filesystem entry.
    ///
    /// Fails if the entry is missing or unreadable, or if its path cannot
    /// cross the segment (non-UTF-8 or over-long).
    pub fn from_path(path: &Path) -> Result<Self, ProtocolError> {
        let encoded = path_bytes(path)?;
        if encoded.len() > MAX_PATH_BYTES {
            return Err(ProtocolError::PathTooLong(encoded.len()));
        }
        let meta = std::fs::symlink_metadata(path)?;
        let links = hard_links(&meta);
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            attributes: FileAttributes::from_metadata(path, &meta),
            links,
            created: unix_secs(meta.created()),
            accessed: unix_secs(meta.accessed()),
            modified: unix_secs(meta.modified()),
            change: ChangeKind::None,
            change_time: 0,
        })
    }

    /// Stamp an observed change onto this snapshot.
    #[must_use]
    pub fn with_change(mut self, change: ChangeKind, change_time: i64) -> Self {
        self.change = change;
        self.change_time = change_time;
        self
    }

    /// True if the path buffer is empty (control payload).
    #[must_use]
    pub fn is_empty_path(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// Encode into `buf` at the fixed field offsets.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(ProtocolError::BufferTooSmall {
                need: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        let path = path_bytes(&self.path)?;
        if path.len() > MAX_PATH_BYTES {
            return Err(ProtocolError::PathTooLong(path.len()));
        }
        buf[..Self::ENCODED_LEN].fill(0);
        buf[PATH_LEN_OFF..PATH_LEN_OFF + 2].copy_from_slice(&(path.len() as u16).to_le_bytes());
        buf[PATH_OFF..PATH_OFF + path.len()].copy_from_slice(path.as_bytes());
        buf[SIZE_OFF..SIZE_OFF + 8].copy_from_slice(&self.size.to_le_bytes());
        buf[ATTR_OFF..ATTR_OFF + 4].copy_from_slice(&self.attributes.bits().to_le_bytes());
        buf[LINKS_OFF..LINKS_OFF + 4].copy_from_slice(&self.links.to_le_bytes());
        buf[CREATED_OFF..CREATED_OFF + 8].copy_from_slice(&self.created.to_le_bytes());
        buf[ACCESSED_OFF..ACCESSED_OFF + 8].copy_from_slice(&self.accessed.to_le_bytes());
        buf[MODIFIED_OFF..MODIFIED_OFF + 8].copy_from_slice(&self.modified.to_le_bytes());
        buf[CHANGE_OFF..CHANGE_OFF + 4]
            .copy_from_slice(&(self.change.as_action()).to_le_bytes());
        buf[CHANGE_TIME_OFF..CHANGE_TIME_OFF + 8]
            .copy_from_slice(&self.change_time.to_le_bytes());
        Ok(())
    }

    /// Decode from the fixed field offsets.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(ProtocolError::BufferTooSmall {
                need: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        let path_len = u16::from_le_bytes(read2(buf, PATH_LEN_OFF)) as usize;
        let path_len = path_len.min(MAX_PATH_BYTES);
        let path = String::from_utf8_lossy(&buf[PATH_OFF..PATH_OFF + path_len]).into_owned();
        let change_raw = u32::from_le_bytes(read4(buf, CHANGE_OFF));
        Ok(Self {
            path: PathBuf::from(path),
            size: u64::from_le_bytes(read8(buf, SIZE_OFF)),
            attributes: FileAttributes::from_bits_truncate(u32::from_le_bytes(read4(
                buf, ATTR_OFF,
            ))),
            links: u32::from_le_bytes(read4(buf, LINKS_OFF)),
            created: i64::from_le_bytes(read8(buf, CREATED_OFF)),
            accessed: i64::from_le_bytes(read8(buf, ACCESSED_OFF)),
            modified: i64::from_le_bytes(read8(buf, MODIFIED_OFF)),
            change: ChangeKind::from_action(change_raw).unwrap_or(ChangeKind::None),
            change_time: i64::from_le_bytes(read8(buf, CHANGE_TIME_OFF)),
        })
    }
}

#[cfg(unix)]
fn hard_links(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink() as u32
}

#[cfg(not(unix))]
fn hard_links(_meta: &std::fs::Metadata) -> u32 {
    1
}

fn path_bytes(path: &Path) -> Result<&str, ProtocolError> {
    path.to_str()
        .ok_or_else(|| ProtocolError::NonUtf8Path(path.to_path_buf()))
}

fn read2(buf: &[u8], off: usize) -> [u8; 2] {
    buf[off..off + 2].try_into().expect("slice length checked")
}

fn read4(buf: &[u8], off: usize) -> [u8; 4] {
    buf[off..off + 4].try_into().expect("slice length checked")
}

fn read8(buf: &[u8], off: usize) -> [u8; 8] {
    buf[off..off + 8].try_into().expect("slice length checked")
}

/// The unit of exchange: exactly one `Message` occupies the shared slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Handshake discriminator.
    pub kind: MsgKind,
    /// Command tag.
    pub command: Command,
    /// Embedded payload.
    pub info: FileInfo,
}

const KIND_OFF: usize = 0;
const COMMAND_OFF: usize = 4;
const INFO_OFF: usize = 8;

impl Message {
    /// Encoded size of one `Message`; also the size of the shared segment.
    pub const ENCODED_LEN: usize = INFO_OFF + FileInfo::ENCODED_LEN;

    #[must_use]
    pub fn new(kind: MsgKind, command: Command, info: FileInfo) -> Self {
        Self {
            kind,
            command,
            info,
        }
    }

    /// An `Empty`/`None` message, the zeroed startup state of the slot.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(MsgKind::Empty, Command::None, FileInfo::empty())
    }

    /// Encode to the full fixed-size slot image.
    pub fn to_bytes(&self) -> Result<[u8; Self::ENCODED_LEN], ProtocolError> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[KIND_OFF..KIND_OFF + 4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[COMMAND_OFF..COMMAND_OFF + 4].copy_from_slice(&(self.command as u32).to_le_bytes());
        self.info.encode(&mut buf[INFO_OFF..])?;
        Ok(buf)
    }

    /// Decode a full slot image.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(ProtocolError::BufferTooSmall {
                need: Self::ENCODED_LEN,
                have: buf.len(),
            });
        }
        Ok(Self {
            kind: MsgKind::try_from(u32::from_le_bytes(read4(buf, KIND_OFF)))?,
            command: Command::try_from(u32::from_le_bytes(read4(buf, COMMAND_OFF)))?,
            info: FileInfo::decode(&buf[INFO_OFF..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> FileInfo {
        FileInfo {
            path: PathBuf::from("/srv/data/report.txt"),
            size: 4096,
            attributes: FileAttributes::ARCHIVE | FileAttributes::READONLY,
            links: 2,
            created: 1_700_000_000,
            accessed: 1_700_000_100,
            modified: 1_700_000_200,
            change: ChangeKind::Modified,
            change_time: 1_700_000_300,
        }
    }

    #[test]
    fn test_fileinfo_roundtrip_all_fields() {
        let info = sample_info();
        let mut buf = [0u8; FileInfo::ENCODED_LEN];
        info.encode(&mut buf).unwrap();
        let decoded = FileInfo::decode(&buf).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_fileinfo_empty_roundtrip() {
        let mut buf = [0u8; FileInfo::ENCODED_LEN];
        FileInfo::empty().encode(&mut buf).unwrap();
        let decoded = FileInfo::decode(&buf).unwrap();
        assert!(decoded.is_empty_path());
        assert_eq!(decoded, FileInfo::empty());
    }

    #[test]
    fn test_fileinfo_zeroed_buffer_decodes_to_empty() {
        let buf = [0u8; FileInfo::ENCODED_LEN];
        let decoded = FileInfo::decode(&buf).unwrap();
        assert_eq!(decoded, FileInfo::empty());
    }

    #[test]
    fn test_fileinfo_path_too_long_rejected() {
        let mut info = FileInfo::empty();
        info.path = PathBuf::from(format!("/{}", "x".repeat(MAX_PATH_BYTES)));
        let mut buf = [0u8; FileInfo::ENCODED_LEN];
        let err = info.encode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::PathTooLong(_)));
    }

    #[test]
    fn test_fileinfo_from_path_missing_file() {
        let err = FileInfo::from_path(Path::new("/fsentry-does-not-exist/x.txt")).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_fileinfo_from_path_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let info = FileInfo::from_path(&file).unwrap();
        assert_eq!(info.path, file);
        assert_eq!(info.size, 5);
        assert!(info.links >= 1);
        assert!(info.modified > 0);
        assert!(!info.attributes.contains(FileAttributes::DIRECTORY));
        assert_eq!(info.change, ChangeKind::None);
    }

    #[test]
    fn test_fileinfo_from_path_directory_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let info = FileInfo::from_path(dir.path()).unwrap();
        assert!(info.attributes.contains(FileAttributes::DIRECTORY));
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(MsgKind::Request, Command::Search, sample_info());
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_zeroed_slot_is_empty() {
        let buf = [0u8; Message::ENCODED_LEN];
        let msg = Message::from_bytes(&buf).unwrap();
        assert_eq!(msg.kind, MsgKind::Empty);
        assert_eq!(msg.command, Command::None);
    }

    #[test]
    fn test_message_unknown_kind_rejected() {
        let mut buf = [0u8; Message::ENCODED_LEN];
        buf[0..4].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            Message::from_bytes(&buf),
            Err(ProtocolError::UnknownKind(99))
        ));
    }

    #[test]
    fn test_command_tag_values_are_stable() {
        // Wire compatibility: these numeric values are part of the protocol.
        assert_eq!(Command::None as u32, 0);
        assert_eq!(Command::Insert as u32, 1);
        assert_eq!(Command::InsertDir as u32, 2);
        assert_eq!(Command::Remove as u32, 3);
        assert_eq!(Command::History as u32, 4);
        assert_eq!(Command::Search as u32, 5);
        assert_eq!(Command::SearchByName as u32, 6);
        assert_eq!(Command::ClearHistory as u32, 7);
        assert_eq!(Command::GetFilesFromDir as u32, 8);
        assert_eq!(Command::GetAllFiles as u32, 9);
        assert_eq!(Command::Continue as u32, 10);
        assert_eq!(Command::Error as u32, 11);
        assert_eq!(Command::ErrorBadArg as u32, 12);
    }

    #[test]
    fn test_command_from_u32_rejects_unknown() {
        for raw in 0..=12u32 {
            assert!(Command::try_from(raw).is_ok());
        }
        assert!(Command::try_from(13).is_err());
    }
}
