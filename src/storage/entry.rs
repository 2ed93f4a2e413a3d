//! Entry Format
//!
//! An entry is the unit of storage and replication: key, value (or
//! tombstone), and the version that decides conflicts.
//!
//! ## Arena Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (28 bytes, LE)            │
//! │ - key_len: u32                   │
//! │ - value_len: u32                 │
//! │ - timestamp: u64                 │
//! │ - seq: u64                       │
//! │ - origin: u8                     │
//! │ - flags: u8 (bit 0: tombstone)   │
//! │ - reserved: 2 bytes              │
//! ├──────────────────────────────────┤
//! │ key bytes                        │
//! │ value bytes (absent if tombstone)│
//! └──────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Size of the fixed entry header in bytes
pub const ENTRY_HEADER_SIZE: usize = 28;

const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Per-node identity, unique across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OriginId(pub u8);

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conflict-resolution version: timestamp first, origin as tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: u64,
    pub origin: OriginId,
}

impl Version {
    pub fn new(timestamp: u64, origin: OriginId) -> Self {
        Version { timestamp, origin }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Equal => self.origin.cmp(&other.origin),
            other => other,
        }
    }
}

/// A key with its value (None = tombstone) and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub version: Version,
}

impl Entry {
    pub fn live(key: Bytes, value: Bytes, version: Version) -> Self {
        Entry {
            key,
            value: Some(value),
            version,
        }
    }

    pub fn tombstone(key: Bytes, version: Version) -> Self {
        Entry {
            key,
            value: None,
            version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Bytes this entry occupies in an arena
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.key.len(), self.value.as_ref().map_or(0, |v| v.len()))
    }
}

/// Bytes an entry with these key/value sizes occupies in an arena
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    ENTRY_HEADER_SIZE + key_len + value_len
}

/// Decoded fixed-size entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub key_len: u32,
    pub value_len: u32,
    pub version: Version,
    pub seq: u64,
    pub tombstone: bool,
}

impl EntryHeader {
    /// Parse a header from the start of `buf`
    pub fn read(mut buf: &[u8]) -> Self {
        debug_assert!(
            buf.len() >= ENTRY_HEADER_SIZE,
            "Precondition: buffer must hold a full header"
        );
        let key_len = buf.get_u32_le();
        let value_len = buf.get_u32_le();
        let timestamp = buf.get_u64_le();
        let seq = buf.get_u64_le();
        let origin = OriginId(buf.get_u8());
        let flags = buf.get_u8();

        EntryHeader {
            key_len,
            value_len,
            version: Version::new(timestamp, origin),
            seq,
            tombstone: flags & FLAG_TOMBSTONE != 0,
        }
    }

    pub fn total_len(&self) -> usize {
        encoded_len(self.key_len as usize, self.value_len as usize)
    }

    /// Key bytes inside an encoded entry
    pub fn key<'a>(&self, encoded: &'a [u8]) -> &'a [u8] {
        let start = ENTRY_HEADER_SIZE;
        &encoded[start..start + self.key_len as usize]
    }

    /// Value bytes inside an encoded entry (None for tombstones)
    pub fn value<'a>(&self, encoded: &'a [u8]) -> Option<&'a [u8]> {
        if self.tombstone {
            return None;
        }
        let start = ENTRY_HEADER_SIZE + self.key_len as usize;
        Some(&encoded[start..start + self.value_len as usize])
    }
}

/// Encode `entry` with local sequence `seq` into the front of `buf`
pub fn write_entry(mut buf: &mut [u8], entry: &Entry, seq: u64) {
    let total = entry.encoded_len();
    debug_assert!(buf.len() >= total, "Precondition: buffer too small for entry");

    let value: &[u8] = entry.value.as_deref().unwrap_or(&[]);
    let flags = if entry.is_tombstone() { FLAG_TOMBSTONE } else { 0 };

    buf.put_u32_le(entry.key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_u64_le(entry.version.timestamp);
    buf.put_u64_le(seq);
    buf.put_u8(entry.version.origin.0);
    buf.put_u8(flags);
    buf.put_u16_le(0);
    buf.put_slice(&entry.key);
    buf.put_slice(value);
}

/// Decode a full entry (copying key and value out of the arena)
pub fn read_entry(encoded: &[u8]) -> (Entry, u64) {
    let header = EntryHeader::read(encoded);
    let entry = Entry {
        key: Bytes::copy_from_slice(header.key(encoded)),
        value: header.value(encoded).map(Bytes::copy_from_slice),
        version: header.version,
    };
    (entry, header.seq)
}
