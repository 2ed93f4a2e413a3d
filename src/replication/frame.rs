//! Replication Wire Frames
//!
//! Every message on a peer connection is one self-describing frame:
//!
//! ```text
//! ┌────────────┬──────────┬─────────────┬───────────────────────┐
//! │ len: u32BE │ kind: u8 │ crc32: u32BE│ payload (len - 5)     │
//! └────────────┴──────────┴─────────────┴───────────────────────┘
//! ```
//!
//! `len` counts everything after itself and is checked against
//! `MAX_FRAME_LEN` before any buffering. The checksum covers the payload.
//! A frame is fully validated (length, kind, checksum, shape, no trailing
//! bytes) before it is handed to the session, so a malformed frame is never
//! partially applied.
//!
//! Entries travel as:
//!
//! ```text
//! key_len u32 | key | flags u8 | [value_len u32 | value] | timestamp u64 | origin u8
//! ```
//!
//! The value fields are present only when the tombstone flag is clear.

use crate::storage::{Entry, OriginId, Version};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION: u16 = 1;

/// Largest accepted value of the length field
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest session name HELLO can carry, in bytes
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

const LEN_FIELD: usize = 4;
/// kind (1) + crc32 (4)
const FRAME_OVERHEAD: usize = 5;

const KIND_HELLO: u8 = 1;
const KIND_SNAPSHOT_ENTRY: u8 = 2;
const KIND_SNAPSHOT_DONE: u8 = 3;
const KIND_DELTA: u8 = 4;
const KIND_ACK: u8 = 5;
const KIND_HEARTBEAT: u8 = 6;

const FLAG_TOMBSTONE: u8 = 0b0000_0001;

/// Cursors a node holds for a peer, offered in HELLO to skip a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursors {
    /// Epoch of the peer incarnation these cursors refer to
    pub peer_epoch: u64,
    /// Last applied seq per peer segment
    pub cursors: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub origin: OriginId,
    pub epoch: u64,
    pub segments: u32,
    pub name: String,
    pub resume: Option<ResumeCursors>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    SnapshotEntry(Entry),
    /// End of snapshot: the last seq covered for every segment
    SnapshotDone { cursors: Vec<u64> },
    Delta { segment: u32, seq: u64, entry: Entry },
    Ack { acks: Vec<(u32, u64)> },
    Heartbeat { sent_at_ms: u64 },
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Hello(_) => KIND_HELLO,
            Frame::SnapshotEntry(_) => KIND_SNAPSHOT_ENTRY,
            Frame::SnapshotDone { .. } => KIND_SNAPSHOT_DONE,
            Frame::Delta { .. } => KIND_DELTA,
            Frame::Ack { .. } => KIND_ACK,
            Frame::Heartbeat { .. } => KIND_HEARTBEAT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "HELLO",
            Frame::SnapshotEntry(_) => "SNAPSHOT_ENTRY",
            Frame::SnapshotDone { .. } => "SNAPSHOT_DONE",
            Frame::Delta { .. } => "DELTA_RECORD",
            Frame::Ack { .. } => "ACK",
            Frame::Heartbeat { .. } => "HEARTBEAT",
        }
    }
}

#[derive(Debug)]
pub enum FrameError {
    TooLarge { len: usize, max: usize },
    UnknownKind(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Stream ended inside a frame
    Truncated,
    Malformed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds maximum {}", len, max)
            }
            FrameError::UnknownKind(kind) => write!(f, "Unknown frame kind: {}", kind),
            FrameError::ChecksumMismatch { expected, actual } => write!(
                f,
                "Frame checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
            FrameError::Truncated => write!(f, "Stream ended mid-frame"),
            FrameError::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
            FrameError::Io(e) => write!(f, "Frame I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// tokio-util codec for `Frame`
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if len < FRAME_OVERHEAD {
            return Err(FrameError::Malformed(format!("length {} below header size", len)));
        }
        if src.len() < LEN_FIELD + len {
            src.reserve(LEN_FIELD + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_FIELD);
        let mut body = src.split_to(len).freeze();
        let kind = body.get_u8();
        let expected = body.get_u32();
        let actual = crc32fast::hash(&body);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let frame = decode_payload(kind, &mut body)?;
        if body.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after {}",
                body.remaining(),
                frame.name()
            )));
        }
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if let Frame::Hello(hello) = &frame {
            if hello.name.len() > MAX_NAME_LEN {
                return Err(FrameError::Malformed(format!(
                    "session name of {} bytes exceeds {}",
                    hello.name.len(),
                    MAX_NAME_LEN
                )));
            }
        }
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u8(frame.kind());
        dst.put_u32(0);
        let payload_start = dst.len();

        encode_payload(&frame, dst);

        let len = dst.len() - start - LEN_FIELD;
        if len > MAX_FRAME_LEN {
            dst.truncate(start);
            return Err(FrameError::TooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let crc = crc32fast::hash(&dst[payload_start..]);
        dst[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        dst[start + 5..start + 9].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }
}

// ============================================================================
// Payload encoding
// ============================================================================

fn encode_payload(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Hello(hello) => {
            dst.put_u16(hello.version);
            dst.put_u8(hello.origin.0);
            dst.put_u64(hello.epoch);
            dst.put_u32(hello.segments);
            let name = hello.name.as_bytes();
            debug_assert!(name.len() <= MAX_NAME_LEN, "Precondition: name checked by encode");
            dst.put_u16(name.len() as u16);
            dst.put_slice(name);
            match &hello.resume {
                Some(resume) => {
                    dst.put_u8(1);
                    dst.put_u64(resume.peer_epoch);
                    put_u64_list(dst, &resume.cursors);
                }
                None => dst.put_u8(0),
            }
        }
        Frame::SnapshotEntry(entry) => put_entry(dst, entry),
        Frame::SnapshotDone { cursors } => put_u64_list(dst, cursors),
        Frame::Delta {
            segment,
            seq,
            entry,
        } => {
            dst.put_u32(*segment);
            dst.put_u64(*seq);
            put_entry(dst, entry);
        }
        Frame::Ack { acks } => {
            dst.put_u32(acks.len() as u32);
            for (segment, seq) in acks {
                dst.put_u32(*segment);
                dst.put_u64(*seq);
            }
        }
        Frame::Heartbeat { sent_at_ms } => dst.put_u64(*sent_at_ms),
    }
}

fn put_u64_list(dst: &mut BytesMut, values: &[u64]) {
    dst.put_u32(values.len() as u32);
    for value in values {
        dst.put_u64(*value);
    }
}

fn put_entry(dst: &mut BytesMut, entry: &Entry) {
    dst.reserve(entry.key.len() + entry.value.as_ref().map_or(0, |v| v.len()) + 18);
    dst.put_u32(entry.key.len() as u32);
    dst.put_slice(&entry.key);
    match &entry.value {
        Some(value) => {
            dst.put_u8(0);
            dst.put_u32(value.len() as u32);
            dst.put_slice(value);
        }
        None => dst.put_u8(FLAG_TOMBSTONE),
    }
    dst.put_u64(entry.version.timestamp);
    dst.put_u8(entry.version.origin.0);
}

// ============================================================================
// Payload decoding
// ============================================================================

fn decode_payload(kind: u8, body: &mut Bytes) -> Result<Frame, FrameError> {
    match kind {
        KIND_HELLO => {
            let version = take_u16(body, "hello version")?;
            let origin = OriginId(take_u8(body, "hello origin")?);
            let epoch = take_u64(body, "hello epoch")?;
            let segments = take_u32(body, "hello segments")?;
            let name_len = take_u16(body, "hello name length")? as usize;
            let name = take_bytes(body, name_len, "hello name")?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| FrameError::Malformed("hello name is not UTF-8".to_string()))?;
            let resume = match take_u8(body, "hello resume flag")? {
                0 => None,
                1 => Some(ResumeCursors {
                    peer_epoch: take_u64(body, "resume epoch")?,
                    cursors: take_u64_list(body, "resume cursors")?,
                }),
                other => {
                    return Err(FrameError::Malformed(format!(
                        "hello resume flag {}",
                        other
                    )))
                }
            };
            Ok(Frame::Hello(Hello {
                version,
                origin,
                epoch,
                segments,
                name,
                resume,
            }))
        }
        KIND_SNAPSHOT_ENTRY => Ok(Frame::SnapshotEntry(take_entry(body)?)),
        KIND_SNAPSHOT_DONE => Ok(Frame::SnapshotDone {
            cursors: take_u64_list(body, "snapshot cursors")?,
        }),
        KIND_DELTA => {
            let segment = take_u32(body, "delta segment")?;
            let seq = take_u64(body, "delta seq")?;
            let entry = take_entry(body)?;
            Ok(Frame::Delta {
                segment,
                seq,
                entry,
            })
        }
        KIND_ACK => {
            let count = take_u32(body, "ack count")? as usize;
            check_count(body, count, 12, "acks")?;
            let mut acks = Vec::with_capacity(count);
            for _ in 0..count {
                let segment = take_u32(body, "ack segment")?;
                let seq = take_u64(body, "ack seq")?;
                acks.push((segment, seq));
            }
            Ok(Frame::Ack { acks })
        }
        KIND_HEARTBEAT => Ok(Frame::Heartbeat {
            sent_at_ms: take_u64(body, "heartbeat")?,
        }),
        other => Err(FrameError::UnknownKind(other)),
    }
}

fn short(what: &str) -> FrameError {
    FrameError::Malformed(format!("payload too short for {}", what))
}

fn take_u8(body: &mut Bytes, what: &str) -> Result<u8, FrameError> {
    if body.remaining() < 1 {
        return Err(short(what));
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes, what: &str) -> Result<u16, FrameError> {
    if body.remaining() < 2 {
        return Err(short(what));
    }
    Ok(body.get_u16())
}

fn take_u32(body: &mut Bytes, what: &str) -> Result<u32, FrameError> {
    if body.remaining() < 4 {
        return Err(short(what));
    }
    Ok(body.get_u32())
}

fn take_u64(body: &mut Bytes, what: &str) -> Result<u64, FrameError> {
    if body.remaining() < 8 {
        return Err(short(what));
    }
    Ok(body.get_u64())
}

fn take_bytes(body: &mut Bytes, len: usize, what: &str) -> Result<Bytes, FrameError> {
    if body.remaining() < len {
        return Err(short(what));
    }
    Ok(body.split_to(len))
}

/// Reject counts that cannot fit in what is left, before allocating
fn check_count(body: &Bytes, count: usize, item_size: usize, what: &str) -> Result<(), FrameError> {
    if count.saturating_mul(item_size) > body.remaining() {
        return Err(FrameError::Malformed(format!(
            "{} count {} exceeds payload",
            what, count
        )));
    }
    Ok(())
}

fn take_u64_list(body: &mut Bytes, what: &str) -> Result<Vec<u64>, FrameError> {
    let count = take_u32(body, what)? as usize;
    check_count(body, count, 8, what)?;
    Ok((0..count).map(|_| body.get_u64()).collect())
}

fn take_entry(body: &mut Bytes) -> Result<Entry, FrameError> {
    let key_len = take_u32(body, "key length")? as usize;
    let key = take_bytes(body, key_len, "key")?;
    let flags = take_u8(body, "entry flags")?;
    if flags & !FLAG_TOMBSTONE != 0 {
        return Err(FrameError::Malformed(format!("entry flags {:#04x}", flags)));
    }
    let value = if flags & FLAG_TOMBSTONE == 0 {
        let value_len = take_u32(body, "value length")? as usize;
        Some(take_bytes(body, value_len, "value")?)
    } else {
        None
    };
    let timestamp = take_u64(body, "timestamp")?;
    let origin = OriginId(take_u8(body, "origin")?);
    Ok(Entry {
        key,
        value,
        version: Version::new(timestamp, origin),
    })
}
