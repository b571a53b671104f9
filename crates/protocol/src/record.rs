//! Raw change-record batches and their bounds-checked decoder.
//!
//! A batch is a run of variable-length records, each carrying the action
//! code and the name of the changed entry relative to the watched
//! directory:
//!
//! - `next_entry_offset: u32` — bytes from the start of this record to the
//!   next one; `0` marks the last record of the batch
//! - `action: u32` — a [`ChangeKind`] action code
//! - `name_len: u32` — length in bytes of the UTF-8 relative name
//! - `name_len` bytes of name, padded to a 4-byte boundary
//!
//! Decoding walks the batch with an explicit cursor and validates every
//! offset and length against the buffer extent before touching it, so a
//! truncated or corrupt batch yields its well-formed prefix instead of an
//! out-of-bounds read.

use std::path::{Path, PathBuf};

/// Size of the fixed portion of one record.
pub const RECORD_HEADER_LEN: usize = 12;

/// Kind of filesystem change attached to a record.
///
/// Numeric values are the wire action codes and are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChangeKind {
    /// No change; placeholder in query payloads.
    None = 0,
    /// Entry was created.
    Created = 1,
    /// Entry was removed.
    Removed = 2,
    /// Entry data or metadata was modified.
    Modified = 3,
    /// Entry was renamed away from this name.
    RenamedFrom = 4,
    /// Entry was renamed to this name.
    RenamedTo = 5,
}

impl ChangeKind {
    /// Decode a wire action code.
    #[must_use]
    pub fn from_action(action: u32) -> Option<Self> {
        match action {
            0 => Some(Self::None),
            1 => Some(Self::Created),
            2 => Some(Self::Removed),
            3 => Some(Self::Modified),
            4 => Some(Self::RenamedFrom),
            5 => Some(Self::RenamedTo),
            _ => None,
        }
    }

    /// The wire action code.
    #[must_use]
    pub fn as_action(self) -> u32 {
        self as u32
    }
}

/// Builder for raw record batches (watcher side and tests).
#[derive(Debug, Default)]
pub struct RecordBatch {
    buf: Vec<u8>,
    last_header: Option<usize>,
}

impl RecordBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record for `name` (relative to the watched directory).
    pub fn push(&mut self, name: &str, kind: ChangeKind) {
        let start = self.buf.len();
        if let Some(prev) = self.last_header {
            let offset = (start - prev) as u32;
            self.buf[prev..prev + 4].copy_from_slice(&offset.to_le_bytes());
        }
        let name = name.as_bytes();
        let padded = (name.len() + 3) & !3;
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.extend_from_slice(&kind.as_action().to_le_bytes());
        self.buf
            .extend_from_slice(&(name.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(name);
        self.buf.resize(start + RECORD_HEADER_LEN + padded, 0);
        self.last_header = Some(start);
    }

    /// Number of bytes the batch occupies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the batch and take the raw buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Decode a raw batch into `(absolute path, change kind)` pairs.
///
/// Lazy and finite: records come out in batch order, and the iterator ends
/// early on the first malformed record. Records with unknown action codes
/// or non-UTF-8 names are skipped, not fatal.
#[must_use]
pub fn decode_records<'a>(buf: &'a [u8], base: &'a Path) -> RecordIter<'a> {
    RecordIter {
        buf,
        base,
        pos: 0,
        done: buf.is_empty(),
    }
}

/// Iterator state for [`decode_records`]: a cursor over the raw buffer.
#[derive(Debug)]
pub struct RecordIter<'a> {
    buf: &'a [u8],
    base: &'a Path,
    pos: usize,
    done: bool,
}

impl Iterator for RecordIter<'_> {
    type Item = (PathBuf, ChangeKind);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let rec = &self.buf[self.pos..];
            if rec.len() < RECORD_HEADER_LEN {
                self.done = true;
                return None;
            }
            let next_offset =
                u32::from_le_bytes(rec[0..4].try_into().expect("header length checked")) as usize;
            let action = u32::from_le_bytes(rec[4..8].try_into().expect("header length checked"));
            let name_len =
                u32::from_le_bytes(rec[8..12].try_into().expect("header length checked")) as usize;

            if name_len == 0 {
                self.done = true;
                return None;
            }
            let Some(name_end) = RECORD_HEADER_LEN.checked_add(name_len) else {
                self.done = true;
                return None;
            };
            if name_end > rec.len() {
                // Truncated record: keep the well-formed prefix only.
                self.done = true;
                return None;
            }
            let name = &rec[RECORD_HEADER_LEN..name_end];

            // Advance the cursor before yielding; a bad next-offset still
            // lets the current record through.
            if next_offset == 0 {
                self.done = true;
            } else {
                match self.pos.checked_add(next_offset) {
                    Some(next_pos)
                        if next_offset >= RECORD_HEADER_LEN && next_pos <= self.buf.len() =>
                    {
                        self.pos = next_pos;
                    }
                    _ => self.done = true,
                }
            }

            let kind = ChangeKind::from_action(action);
            let name = std::str::from_utf8(name).ok();
            match (kind, name) {
                (Some(kind), Some(name)) if kind != ChangeKind::None => {
                    return Some((self.base.join(name), kind));
                }
                _ => continue,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(entries: &[(&str, ChangeKind)]) -> Vec<u8> {
        let mut b = RecordBatch::new();
        for (name, kind) in entries {
            b.push(name, *kind);
        }
        b.into_bytes()
    }

    #[test]
    fn test_decode_single_record() {
        let buf = batch(&[("a.txt", ChangeKind::Created)]);
        let base = Path::new("/watched");
        let out: Vec<_> = decode_records(&buf, base).collect();
        assert_eq!(out, vec![(PathBuf::from("/watched/a.txt"), ChangeKind::Created)]);
    }

    #[test]
    fn test_decode_preserves_record_order() {
        let entries = [
            ("one", ChangeKind::Created),
            ("two/nested.log", ChangeKind::Modified),
            ("three", ChangeKind::Removed),
            ("old-name", ChangeKind::RenamedFrom),
            ("new-name", ChangeKind::RenamedTo),
        ];
        let buf = batch(&entries);
        let base = Path::new("/d");
        let out: Vec<_> = decode_records(&buf, base).collect();
        assert_eq!(out.len(), entries.len());
        for ((path, kind), (name, expected)) in out.iter().zip(entries.iter()) {
            assert_eq!(path, &base.join(name));
            assert_eq!(kind, expected);
        }
    }

    #[test]
    fn test_decode_empty_buffer() {
        let out: Vec<_> = decode_records(&[], Path::new("/d")).collect();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_stops_on_zero_name_len() {
        let mut buf = batch(&[("keep", ChangeKind::Created)]);
        // Chain a terminator record: fix up the first next-offset by hand.
        let first_len = buf.len();
        buf[0..4].copy_from_slice(&(first_len as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // next
        buf.extend_from_slice(&1u32.to_le_bytes()); // action
        buf.extend_from_slice(&0u32.to_le_bytes()); // name_len == 0
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_decode_truncated_name_yields_prefix() {
        let mut buf = batch(&[("first", ChangeKind::Created)]);
        let first_len = buf.len();
        buf[0..4].copy_from_slice(&(first_len as u32).to_le_bytes());
        // Second record claims a 64-byte name but the buffer ends early.
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&64u32.to_le_bytes());
        buf.extend_from_slice(b"short");
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert_eq!(out, vec![(PathBuf::from("/d/first"), ChangeKind::Created)]);
    }

    #[test]
    fn test_decode_truncated_header_yields_nothing() {
        let buf = [0u8; RECORD_HEADER_LEN - 1];
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_next_offset_past_end_stops_after_record() {
        let mut buf = batch(&[("only", ChangeKind::Modified)]);
        // Claim a next record far past the buffer.
        buf[0..4].copy_from_slice(&1_000_000u32.to_le_bytes());
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_decode_non_advancing_offset_terminates() {
        let mut buf = batch(&[("loop", ChangeKind::Created)]);
        // next_entry_offset smaller than a header cannot advance; the
        // decoder must not spin forever.
        buf[0..4].copy_from_slice(&4u32.to_le_bytes());
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_decode_skips_unknown_action() {
        let mut buf = batch(&[("weird", ChangeKind::Created), ("ok", ChangeKind::Removed)]);
        // Overwrite the first record's action with an unknown code.
        buf[4..8].copy_from_slice(&77u32.to_le_bytes());
        let out: Vec<_> = decode_records(&buf, Path::new("/d")).collect();
        assert_eq!(out, vec![(PathBuf::from("/d/ok"), ChangeKind::Removed)]);
    }

    #[test]
    fn test_encoder_pads_records_to_alignment() {
        let mut b = RecordBatch::new();
        b.push("a", ChangeKind::Created);
        assert_eq!(b.len() % 4, 0);
        b.push("abcd", ChangeKind::Created);
        assert_eq!(b.len() % 4, 0);
    }

    #[test]
    fn test_change_kind_action_roundtrip() {
        for kind in [
            ChangeKind::Created,
            ChangeKind::Removed,
            ChangeKind::Modified,
            ChangeKind::RenamedFrom,
            ChangeKind::RenamedTo,
        ] {
            assert_eq!(ChangeKind::from_action(kind.as_action()), Some(kind));
        }
        assert_eq!(ChangeKind::from_action(42), None);
    }
}
