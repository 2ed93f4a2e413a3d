//! Peer Bookkeeping
//!
//! - `PeerDirectory`: what this node has applied from each remote node,
//!   kept across sessions so a reconnect can resume instead of re-bootstrap.
//! - `StatusBoard`: liveness of every connector and inbound session,
//!   exposed through `ReplicatedMap::peer_status`.
//! - `Backoff`: reconnect delays, exponential with jitter.

use super::frame::{Hello, ResumeCursors};
use super::registry::Direction;
use super::session::SessionState;
use crate::storage::OriginId;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

// ============================================================================
// Peer directory
// ============================================================================

/// Replay position for one remote node incarnation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PeerRecord {
    epoch: u64,
    /// Last applied seq per remote segment
    cursors: Vec<u64>,
    /// Cursors are complete: a snapshot from this epoch was fully received
    bootstrapped: bool,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: Mutex<HashMap<OriginId, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursors to offer `peer` in our HELLO, if we hold complete ones
    pub fn resume_for(&self, peer: OriginId) -> Option<ResumeCursors> {
        let records = self.records.lock();
        let record = records.get(&peer)?;
        record.bootstrapped.then(|| ResumeCursors {
            peer_epoch: record.epoch,
            cursors: record.cursors.clone(),
        })
    }

    /// Forget cursors that belong to a previous incarnation of the peer
    pub fn observe_hello(&self, hello: &Hello) {
        let mut records = self.records.lock();
        let record = records.entry(hello.origin).or_default();
        if record.epoch != hello.epoch || record.cursors.len() != hello.segments as usize {
            *record = PeerRecord {
                epoch: hello.epoch,
                cursors: vec![0; hello.segments as usize],
                bootstrapped: false,
            };
        }
    }

    /// The peer finished a snapshot covering up to `cursors`
    pub fn snapshot_done(&self, peer: OriginId, cursors: &[u64]) {
        let mut records = self.records.lock();
        let record = records.entry(peer).or_default();
        record.cursors = cursors.to_vec();
        record.bootstrapped = true;
    }

    /// A delta with `seq` from peer segment `segment` was applied
    pub fn advance(&self, peer: OriginId, segment: u32, seq: u64) {
        let mut records = self.records.lock();
        if let Some(cursor) = records
            .get_mut(&peer)
            .and_then(|r| r.cursors.get_mut(segment as usize))
        {
            *cursor = (*cursor).max(seq);
        }
    }

    pub fn cursors(&self, peer: OriginId) -> Option<Vec<u64>> {
        self.records.lock().get(&peer).map(|r| r.cursors.clone())
    }
}

// ============================================================================
// Status
// ============================================================================

/// Liveness of one connector or inbound session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    /// Configured endpoint, or remote address for inbound sessions
    pub endpoint: String,
    pub direction: Direction,
    pub peer: Option<OriginId>,
    /// Session name the peer announced
    pub peer_name: Option<String>,
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl PeerStatus {
    pub fn new(endpoint: impl Into<String>, direction: Direction) -> Self {
        PeerStatus {
            endpoint: endpoint.into(),
            direction,
            peer: None,
            peer_name: None,
            state: SessionState::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: Mutex<BTreeMap<String, PeerStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, status: PeerStatus) {
        self.entries.lock().insert(status.endpoint.clone(), status);
    }

    pub fn update(&self, endpoint: &str, f: impl FnOnce(&mut PeerStatus)) {
        if let Some(status) = self.entries.lock().get_mut(endpoint) {
            f(status);
        }
    }

    pub fn set_state(&self, endpoint: &str, state: SessionState) {
        self.update(endpoint, |status| status.state = state);
    }

    pub fn remove(&self, endpoint: &str) {
        self.entries.lock().remove(endpoint);
    }

    pub fn snapshot(&self) -> Vec<PeerStatus> {
        self.entries.lock().values().cloned().collect()
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect backoff: initial, doubling up to max, ±20% jitter
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    rng: ChaCha8Rng,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self::with_rng(initial, max, ChaCha8Rng::from_entropy())
    }

    pub fn with_seed(initial: Duration, max: Duration, seed: u64) -> Self {
        Self::with_rng(initial, max, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(initial: Duration, max: Duration, rng: ChaCha8Rng) -> Self {
        debug_assert!(initial <= max, "Precondition: initial backoff must not exceed max");
        Backoff {
            initial,
            max,
            current: initial,
            attempts: 0,
            rng,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);

        let jitter: f64 = self.rng.gen_range(0.8..=1.2);
        base.mul_f64(jitter)
    }

    /// Connection established: start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
