//! Segment: Index + Arena + Modification Log
//!
//! A segment is the unit of locking. Everything a mutation touches (the
//! index slot, the entry bytes, the log record) lives inside one `Segment`,
//! so the table wraps each in its own mutex and a mutation plus its log
//! append happen in a single critical section.
//!
//! ```text
//! ┌──────────── Segment ────────────┐
//! │ HashIndex   tag → chunk pos     │
//! │ Arena       [hdr|key|val]...    │
//! │ ModLog      seq → Entry         │
//! └─────────────────────────────────┘
//! ```
//!
//! Tombstones are ordinary stored entries with the tombstone flag set. They
//! occupy an index slot and arena chunks until purged.

use super::arena::{Arena, ChunkRun};
use super::entry::{read_entry, write_entry, Entry, EntryHeader, Version};
use super::index::HashIndex;
use super::modlog::{LogGap, LogRecord, ModificationLog, SessionId};
use bytes::Bytes;

/// Storage error surfaced synchronously to map callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Segment has no free slot or no contiguous run of chunks
    CapacityExceeded { segment: u32, needed_chunks: usize },
    /// Entry is larger than a whole segment arena
    EntryTooLarge { len: usize, max: usize },
    /// Table has been released
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CapacityExceeded {
                segment,
                needed_chunks,
            } => write!(
                f,
                "Capacity exceeded in segment {} ({} chunks needed)",
                segment, needed_chunks
            ),
            StoreError::EntryTooLarge { len, max } => {
                write!(f, "Entry of {} bytes exceeds segment size {}", len, max)
            }
            StoreError::Closed => write!(f, "Map is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Sizing of one segment, derived from the map configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Maximum stored entries (live + tombstones)
    pub max_entries: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub retain_records: usize,
    pub max_records: usize,
}

/// Every stored entry of a segment plus the log head at capture time
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub entries: Vec<Entry>,
    pub head: u64,
}

struct Located {
    slot: usize,
    run: ChunkRun,
    header: EntryHeader,
}

pub struct Segment {
    id: u32,
    index: HashIndex,
    arena: Arena,
    log: ModificationLog,
    max_entries: usize,
    /// Stored entries that are not tombstones
    live: usize,
    released: bool,
}

impl Segment {
    pub fn new(id: u32, layout: &SegmentLayout) -> Self {
        debug_assert!(layout.max_entries > 0, "Precondition: segment needs capacity");
        Segment {
            id,
            index: HashIndex::with_capacity(layout.max_entries),
            arena: Arena::new(layout.chunk_count, layout.chunk_size),
            log: ModificationLog::new(id, layout.retain_records, layout.max_records),
            max_entries: layout.max_entries,
            live: 0,
            released: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Live (non-tombstone) entries
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Stored entries including tombstones
    pub fn stored(&self) -> usize {
        self.index.len()
    }

    pub fn used_chunks(&self) -> usize {
        self.arena.used_chunks()
    }

    pub fn head_seq(&self) -> u64 {
        self.log.head_seq()
    }

    pub fn log(&self) -> &ModificationLog {
        &self.log
    }

    fn locate(&self, tag: u32, key: &[u8]) -> Option<Located> {
        let arena = &self.arena;
        let (slot, pos) = self.index.find(tag, |pos| {
            let encoded = arena.tail(pos);
            EntryHeader::read(encoded).key(encoded) == key
        })?;
        let header = EntryHeader::read(arena.tail(pos));
        let run = ChunkRun {
            start: pos,
            count: arena.chunks_for(header.total_len()) as u32,
        };
        Some(Located { slot, run, header })
    }

    /// Live value for `key`, None if absent or tombstoned
    pub fn get(&self, tag: u32, key: &[u8]) -> Option<Bytes> {
        let found = self.locate(tag, key)?;
        found
            .header
            .value(self.arena.bytes(found.run))
            .map(Bytes::copy_from_slice)
    }

    /// Version of the stored entry for `key`, tombstones included
    pub fn version_of(&self, tag: u32, key: &[u8]) -> Option<Version> {
        self.locate(tag, key).map(|found| found.header.version)
    }

    /// Store `entry` unconditionally and append it to the log.
    /// Returns the previous live value.
    pub fn write(&mut self, tag: u32, entry: Entry) -> Result<Option<Bytes>, StoreError> {
        if self.released {
            return Err(StoreError::Closed);
        }
        let len = entry.encoded_len();
        if len > self.arena.capacity_bytes() {
            return Err(StoreError::EntryTooLarge {
                len,
                max: self.arena.capacity_bytes(),
            });
        }
        let needed = self.arena.chunks_for(len);
        let capacity_exceeded = StoreError::CapacityExceeded {
            segment: self.id,
            needed_chunks: needed,
        };

        let (run, previous) = match self.locate(tag, &entry.key) {
            Some(found) => {
                let previous = found
                    .header
                    .value(self.arena.bytes(found.run))
                    .map(Bytes::copy_from_slice);
                let held = found.run.count as usize;

                let run = if needed <= held {
                    // Shrink in place, returning the tail chunks
                    if needed < held {
                        self.arena.free(ChunkRun {
                            start: found.run.start + needed as u32,
                            count: (held - needed) as u32,
                        });
                    }
                    ChunkRun {
                        start: found.run.start,
                        count: needed as u32,
                    }
                } else {
                    let run = self.arena.allocate(len).ok_or(capacity_exceeded)?;
                    self.arena.free(found.run);
                    self.index.relocate(found.slot, run.start);
                    run
                };
                (run, previous)
            }
            None => {
                if self.index.len() >= self.max_entries {
                    return Err(capacity_exceeded);
                }
                let run = self.arena.allocate(len).ok_or(capacity_exceeded.clone())?;
                if self.index.insert(tag, run.start).is_none() {
                    self.arena.free(run);
                    return Err(capacity_exceeded);
                }
                (run, None)
            }
        };

        if previous.is_some() {
            self.live -= 1;
        }
        if !entry.is_tombstone() {
            self.live += 1;
        }

        let seq = self.log.head_seq() + 1;
        write_entry(self.arena.bytes_mut(run), &entry, seq);
        let logged = self.log.append(entry);

        debug_assert_eq!(logged, seq, "Postcondition: stored seq must match log seq");
        debug_assert!(
            self.live <= self.index.len(),
            "Invariant: live entries cannot exceed stored entries"
        );
        Ok(previous)
    }

    /// Live (key, value) pairs
    pub fn entries(&self) -> Vec<(Bytes, Bytes)> {
        self.index
            .occupied()
            .filter_map(|(_, pos)| {
                let (entry, _) = read_entry(self.arena.tail(pos));
                entry.value.map(|value| (entry.key, value))
            })
            .collect()
    }

    /// Capture every stored entry and register `session` at the current head,
    /// so the session's deltas continue exactly after the snapshot.
    pub fn snapshot(&mut self, session: SessionId) -> SegmentSnapshot {
        let entries = self
            .index
            .occupied()
            .map(|(_, pos)| read_entry(self.arena.tail(pos)).0)
            .collect();
        let head = self.log.head_seq();
        if !self.released {
            self.log.register(session, head);
        }
        SegmentSnapshot { entries, head }
    }

    /// Register `session` to continue after `cursor` if those records are
    /// still retained
    pub fn try_resume(&mut self, session: SessionId, cursor: u64) -> bool {
        if self.released || !self.log.can_resume_from(cursor) {
            return false;
        }
        self.log.register(session, cursor);
        true
    }

    /// Up to `max` records starting at `from`
    pub fn read_log(&self, from: u64, max: usize) -> Result<Vec<LogRecord>, LogGap> {
        Ok(self.log.read_from(from)?.take(max).cloned().collect())
    }

    pub fn ack(&mut self, session: SessionId, seq: u64) {
        self.log.ack_up_to(session, seq);
    }

    pub fn unregister(&mut self, session: SessionId) {
        self.log.unregister(session);
    }

    /// Drop tombstones older than `cutoff`, freeing their slot and chunks.
    /// Not logged: a purge is local housekeeping.
    pub fn purge_tombstones(&mut self, cutoff: u64) -> usize {
        let expired: Vec<(usize, ChunkRun)> = self
            .index
            .occupied()
            .filter_map(|(slot, pos)| {
                let header = EntryHeader::read(self.arena.tail(pos));
                (header.tombstone && header.version.timestamp < cutoff).then(|| {
                    let run = ChunkRun {
                        start: pos,
                        count: self.arena.chunks_for(header.total_len()) as u32,
                    };
                    (slot, run)
                })
            })
            .collect();

        for (slot, run) in &expired {
            self.index.remove(*slot);
            self.arena.free(*run);
        }
        if self.index.needs_rebuild() {
            self.index.rebuild();
        }
        expired.len()
    }

    /// Free the arena, index and log. Later writes fail with `Closed`.
    pub fn release(&mut self) {
        self.index.release();
        self.arena.release();
        self.log.clear();
        self.live = 0;
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("live", &self.live)
            .field("stored", &self.index.len())
            .field("used_chunks", &self.arena.used_chunks())
            .field("head_seq", &self.log.head_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::OriginId;

    fn layout(max_entries: usize, chunk_count: usize) -> SegmentLayout {
        SegmentLayout {
            max_entries,
            chunk_count,
            chunk_size: 32,
            retain_records: 16,
            max_records: 1024,
        }
    }

    fn live(key: &str, value: &str, ts: u64) -> Entry {
        Entry::live(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            Version::new(ts, OriginId(1)),
        )
    }

    fn tombstone(key: &str, ts: u64) -> Entry {
        Entry::tombstone(
            Bytes::copy_from_slice(key.as_bytes()),
            Version::new(ts, OriginId(1)),
        )
    }

    #[test]
    fn test_write_then_get() {
        let mut seg = Segment::new(0, &layout(8, 64));
        assert_eq!(seg.write(1, live("a", "one", 1)).unwrap(), None);
        assert_eq!(seg.get(1, b"a"), Some(Bytes::from_static(b"one")));
        assert_eq!(seg.get(1, b"b"), None);
        assert_eq!(seg.len(), 1);
        assert_eq!(seg.head_seq(), 1);
    }

    #[test]
    fn test_same_tag_different_keys() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(9, live("a", "1", 1)).unwrap();
        seg.write(9, live("b", "2", 2)).unwrap();
        assert_eq!(seg.get(9, b"a"), Some(Bytes::from_static(b"1")));
        assert_eq!(seg.get(9, b"b"), Some(Bytes::from_static(b"2")));
        assert_eq!(seg.stored(), 2);
    }

    #[test]
    fn test_overwrite_returns_previous_and_resizes() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(1, live("k", "small", 1)).unwrap();
        let used_small = seg.used_chunks();

        let big = "x".repeat(200);
        let prev = seg.write(1, live("k", &big, 2)).unwrap();
        assert_eq!(prev, Some(Bytes::from_static(b"small")));
        assert!(seg.used_chunks() > used_small);

        let prev = seg.write(1, live("k", "tiny", 3)).unwrap();
        assert_eq!(prev.as_deref(), Some(big.as_bytes()));
        assert_eq!(seg.used_chunks(), used_small, "Shrinking frees tail chunks");
        assert_eq!(seg.get(1, b"k"), Some(Bytes::from_static(b"tiny")));
        assert_eq!(seg.stored(), 1);
    }

    #[test]
    fn test_tombstone_hides_value_but_keeps_version() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(1, live("k", "v", 1)).unwrap();
        let prev = seg.write(1, tombstone("k", 2)).unwrap();
        assert_eq!(prev, Some(Bytes::from_static(b"v")));

        assert_eq!(seg.get(1, b"k"), None);
        assert_eq!(seg.version_of(1, b"k"), Some(Version::new(2, OriginId(1))));
        assert_eq!(seg.len(), 0);
        assert_eq!(seg.stored(), 1, "Tombstones count toward capacity");
    }

    #[test]
    fn test_capacity_exceeded_by_entry_count() {
        let mut seg = Segment::new(3, &layout(2, 64));
        seg.write(1, live("a", "1", 1)).unwrap();
        seg.write(2, live("b", "2", 2)).unwrap();
        let err = seg.write(3, live("c", "3", 3)).unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { segment: 3, .. }));

        // Existing keys can still be updated
        seg.write(1, live("a", "11", 4)).unwrap();
        assert_eq!(seg.head_seq(), 3, "Failed write must not be logged");
    }

    #[test]
    fn test_capacity_exceeded_by_arena() {
        let mut seg = Segment::new(0, &layout(8, 4));
        let value = "v".repeat(90);
        seg.write(1, live("a", &value, 1)).unwrap();
        let err = seg.write(2, live("b", &value, 2)).unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }));
        assert_eq!(seg.stored(), 1, "Failed insert must not leave an index slot");
    }

    #[test]
    fn test_entry_larger_than_arena() {
        let mut seg = Segment::new(0, &layout(8, 4));
        let err = seg.write(1, live("a", &"v".repeat(1000), 1)).unwrap_err();
        assert!(matches!(err, StoreError::EntryTooLarge { max: 128, .. }));
    }

    #[test]
    fn test_every_write_is_logged_in_order() {
        let mut seg = Segment::new(5, &layout(8, 64));
        seg.write(1, live("a", "1", 10)).unwrap();
        seg.write(2, live("b", "2", 11)).unwrap();
        seg.write(1, tombstone("a", 12)).unwrap();

        let records = seg.read_log(1, 10).unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(records.iter().all(|r| r.segment == 5));
        assert!(records[2].entry.is_tombstone());

        assert_eq!(seg.read_log(2, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_includes_tombstones_and_registers_session() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(1, live("a", "1", 1)).unwrap();
        seg.write(2, live("b", "2", 2)).unwrap();
        seg.write(2, tombstone("b", 3)).unwrap();

        let snapshot = seg.snapshot(SessionId(7));
        assert_eq!(snapshot.head, 3);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries.iter().filter(|e| e.is_tombstone()).count(), 1);
        assert_eq!(seg.log().registered_sessions(), 1);
        assert_eq!(seg.log().min_unacked_seq(), 4);
    }

    #[test]
    fn test_try_resume_requires_retained_records() {
        let mut seg = Segment::new(0, &layout(64, 256));
        for n in 0..40u64 {
            seg.write(n as u32, live(&format!("k{}", n), "v", n + 1)).unwrap();
        }
        // retain_records = 16: seqs 25..=40 remain
        assert!(seg.try_resume(SessionId(1), 30));
        assert!(seg.try_resume(SessionId(2), 24));
        assert!(!seg.try_resume(SessionId(3), 10));
        assert!(!seg.try_resume(SessionId(4), 41));
        assert_eq!(seg.log().registered_sessions(), 2);
    }

    #[test]
    fn test_purge_tombstones_frees_capacity() {
        let mut seg = Segment::new(0, &layout(4, 64));
        for (tag, key) in ["a", "b", "c", "d"].iter().enumerate() {
            seg.write(tag as u32, live(key, "v", 1)).unwrap();
            seg.write(tag as u32, tombstone(key, 5 + tag as u64)).unwrap();
        }
        assert!(seg.write(9, live("e", "v", 20)).is_err());

        // Only tombstones strictly older than the cutoff go
        assert_eq!(seg.purge_tombstones(7), 2);
        assert_eq!(seg.stored(), 2);
        assert_eq!(seg.version_of(0, b"a"), None);
        assert_eq!(seg.version_of(2, b"c"), Some(Version::new(7, OriginId(1))));

        seg.write(9, live("e", "v", 20)).unwrap();
        assert_eq!(seg.get(9, b"e"), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn test_entries_skip_tombstones() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(1, live("a", "1", 1)).unwrap();
        seg.write(2, live("b", "2", 2)).unwrap();
        seg.write(2, tombstone("b", 3)).unwrap();

        let entries = seg.entries();
        assert_eq!(entries, vec![(Bytes::from_static(b"a"), Bytes::from_static(b"1"))]);
    }

    #[test]
    fn test_release_rejects_writes() {
        let mut seg = Segment::new(0, &layout(8, 64));
        seg.write(1, live("a", "1", 1)).unwrap();
        seg.release();
        assert!(seg.is_released());
        assert_eq!(seg.get(1, b"a"), None);
        assert_eq!(seg.write(1, live("a", "2", 2)), Err(StoreError::Closed));
        assert!(!seg.try_resume(SessionId(1), 0));
    }
}
