//! Segment Table
//!
//! The node-local store. Keys hash to one of N segments, each behind its
//! own `parking_lot::Mutex`; an operation only ever takes the lock of its
//! key's segment.
//!
//! ```text
//!            hash(key) = ahash(fixed seeds)
//!           ┌───────────────┴───────────────┐
//!        high 32 bits                   low 32 bits
//!    segment = hi % N                  index tag / bucket
//!
//!   ┌─────────┐ ┌─────────┐       ┌─────────┐
//!   │ Mutex   │ │ Mutex   │  ...  │ Mutex   │
//!   │ Segment │ │ Segment │       │ Segment │
//!   └─────────┘ └─────────┘       └─────────┘
//! ```
//!
//! Local writes take their timestamp from the node's `HybridClock` while
//! holding the segment lock, so they always supersede whatever the segment
//! holds. Remote entries go through the conflict resolver and, when they
//! win, are re-logged with their original version.
//!
//! Every logged mutation bumps a counter on a `watch` channel that peer
//! streamers wait on when they have drained every log.

use super::entry::{Entry, OriginId, Version};
use super::modlog::{LogGap, LogRecord, SessionId};
use super::segment::{Segment, SegmentLayout, SegmentSnapshot, StoreError};
use crate::clock::HybridClock;
use crate::replication::conflict::{resolve, Resolution};
use bytes::Bytes;
use parking_lot::Mutex;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub struct SegmentTable {
    segments: Box<[Mutex<Segment>]>,
    hasher: ahash::RandomState,
    origin: OriginId,
    clock: Arc<HybridClock>,
    changes: watch::Sender<u64>,
    closed: AtomicBool,
}

impl SegmentTable {
    pub fn new(
        origin: OriginId,
        clock: Arc<HybridClock>,
        segment_count: usize,
        layout: SegmentLayout,
    ) -> Self {
        debug_assert!(segment_count > 0, "Precondition: need at least one segment");
        debug_assert!(
            segment_count <= u32::MAX as usize,
            "Precondition: segment ids must fit u32"
        );

        let segments = (0..segment_count)
            .map(|id| Mutex::new(Segment::new(id as u32, &layout)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (changes, _) = watch::channel(0);

        SegmentTable {
            segments,
            hasher: ahash::RandomState::with_seeds(
                HASH_SEEDS[0],
                HASH_SEEDS[1],
                HASH_SEEDS[2],
                HASH_SEEDS[3],
            ),
            origin,
            clock,
            changes,
            closed: AtomicBool::new(false),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// (segment, tag) for `key`
    #[inline]
    pub fn locate(&self, key: &[u8]) -> (usize, u32) {
        let hash = self.hasher.hash_one(key);
        let segment = ((hash >> 32) % self.segments.len() as u64) as usize;
        (segment, hash as u32)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn notify(&self) {
        self.changes.send_modify(|counter| *counter = counter.wrapping_add(1));
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        let (segment, tag) = self.locate(key);
        Ok(self.segments[segment].lock().get(tag, key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Store `value` under `key`, returning the previous live value
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        let (segment, tag) = self.locate(&key);
        let previous = {
            let mut seg = self.segments[segment].lock();
            let version = Version::new(self.clock.issue(), self.origin);
            seg.write(tag, Entry::live(key, value, version))?
        };
        self.notify();
        Ok(previous)
    }

    /// Tombstone `key`, returning the previous live value.
    /// An absent key still gets a tombstone so an older put from a peer
    /// cannot revive it; removing an already removed key changes nothing.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.check_open()?;
        let (segment, tag) = self.locate(key);
        let previous = {
            let mut seg = self.segments[segment].lock();
            if seg.get(tag, key).is_none() && seg.version_of(tag, key).is_some() {
                return Ok(None);
            }
            let version = Version::new(self.clock.issue(), self.origin);
            seg.write(tag, Entry::tombstone(Bytes::copy_from_slice(key), version))?
        };
        self.notify();
        Ok(previous)
    }

    /// Live entries across all segments
    pub fn len(&self) -> usize {
        self.segments.iter().map(|seg| seg.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every live (key, value), one segment lock at a time
    pub fn entries(&self) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        self.check_open()?;
        let mut out = Vec::new();
        for seg in self.segments.iter() {
            out.extend(seg.lock().entries());
        }
        Ok(out)
    }

    /// Stored version for `key`, tombstones included
    pub fn version_of(&self, key: &[u8]) -> Option<Version> {
        let (segment, tag) = self.locate(key);
        self.segments[segment].lock().version_of(tag, key)
    }

    // ========================================================================
    // Replication operations
    // ========================================================================

    /// Resolve `entry` against local state; store and re-log it if it wins
    pub fn apply_remote(&self, entry: Entry) -> Result<Resolution, StoreError> {
        self.check_open()?;
        self.clock.observe(entry.version.timestamp);

        let (segment, tag) = self.locate(&entry.key);
        let resolution = {
            let mut seg = self.segments[segment].lock();
            let resolution = resolve(seg.version_of(tag, &entry.key), entry.version);
            if resolution.is_apply() {
                seg.write(tag, entry)?;
            }
            resolution
        };
        if resolution.is_apply() {
            self.notify();
        }
        Ok(resolution)
    }

    /// Capture segment `segment` and register `session` at its head
    pub fn snapshot_segment(
        &self,
        segment: usize,
        session: SessionId,
    ) -> Result<SegmentSnapshot, StoreError> {
        self.check_open()?;
        Ok(self.segments[segment].lock().snapshot(session))
    }

    /// Register `session` to continue segment `segment` after `cursor`
    pub fn try_resume(&self, segment: usize, session: SessionId, cursor: u64) -> bool {
        !self.is_closed() && self.segments[segment].lock().try_resume(session, cursor)
    }

    pub fn read_log(
        &self,
        segment: usize,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogGap> {
        self.segments[segment].lock().read_log(from, max)
    }

    pub fn head_seq(&self, segment: usize) -> u64 {
        self.segments[segment].lock().head_seq()
    }

    pub fn ack(&self, segment: usize, session: SessionId, seq: u64) {
        self.segments[segment].lock().ack(session, seq);
    }

    /// Stop holding log records for `session` in every segment
    pub fn unregister(&self, session: SessionId) {
        for seg in self.segments.iter() {
            seg.lock().unregister(session);
        }
    }

    /// Change counter bumped on every logged mutation
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Purge tombstones older than `age`, returning how many were dropped
    pub fn purge_tombstones(&self, age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(age.as_millis() as u64);
        self.segments
            .iter()
            .map(|seg| seg.lock().purge_tombstones(cutoff))
            .sum()
    }

    /// Free every segment. Idempotent; later operations fail with `Closed`.
    pub fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for seg in self.segments.iter() {
            seg.lock().release();
        }
        self.notify();
    }
}

impl std::fmt::Debug for SegmentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTable")
            .field("origin", &self.origin)
            .field("segments", &self.segments.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
