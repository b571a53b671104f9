//! fsentry protocol - shared types for the daemon and its external client.
//!
//! This crate provides:
//! - [`Message`], [`Command`] and [`FileInfo`] — the fixed-layout payload
//!   occupying the single shared-memory slot
//! - [`decode_records`] / [`RecordBatch`] — the raw change-record batch
//!   format produced by the watch primitive and its bounds-checked decoder
//! - [`IpcChannel`] / [`IpcClient`] — the mutex-guarded single-slot channel
//!   and the client-side request helper
//! - Segment path helpers via [`segment_path`]
//!
//! # Wire format
//!
//! The slot is exactly [`Message::ENCODED_LEN`] bytes. Every field sits at
//! a fixed little-endian offset and the path lives in a bounded buffer, so
//! a whole message is safe to copy byte-for-byte across the segment.
//!
//! # Handshake
//!
//! The client writes a `Request`, the server answers with one or more
//! `Response` messages (`Continue`* then `None`, or a single error tag),
//! and the client frees the slot after consuming each one. Exactly one
//! request is outstanding at a time; the [`MsgKind`] discriminator is the
//! whole handshake.

mod channel;
mod message;
mod record;

// Re-export main types at crate root
pub use channel::{
    ChannelError, ClientError, DEFAULT_SEGMENT_PATH, IpcChannel, IpcClient, POLL_BACKOFF_MAX,
    POLL_BACKOFF_MIN, SEGMENT_ENV_VAR, segment_path, segment_path_with_xdg_fallback,
};
pub use message::{
    Command, FileAttributes, FileInfo, MAX_PATH_BYTES, Message, MsgKind, ProtocolError,
    now_unix_secs,
};
pub use record::{ChangeKind, RECORD_HEADER_LEN, RecordBatch, RecordIter, decode_records};

/// Protocol version for compatibility checking.
///
/// Increment this when making breaking changes to the slot layout.
pub const PROTOCOL_VERSION: u32 = 1;
