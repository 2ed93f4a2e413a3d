//! Deterministic Simulation Testing for Replication Convergence
//!
//! Runs N in-memory nodes wired by simulated connections. Each connection
//! carries the real `Streamer` / `Receiver` / `SessionLink` pipeline; only
//! the socket is replaced by a pair of frame queues, so delivery order,
//! duplication and disconnects are driven by a seeded RNG:
//!
//! ```text
//! for seed in 0..100 {
//!     let mut harness = ConvergenceHarness::new(ConvergenceConfig::chaos(seed));
//!     harness.run(500);          // writes, partial pumps, faults
//!     harness.quiesce();         // reconnect everything, drain queues
//!     harness.check_convergence(); // every node == last-writer-wins oracle
//! }
//! ```
//!
//! The oracle keeps the highest version ever issued per key. After
//! quiescence every node must hold exactly that version for every key,
//! tombstones included.

use super::frame::{Frame, Hello, PROTOCOL_VERSION};
use super::peer::PeerDirectory;
use super::receiver::Receiver;
use super::session::SessionLink;
use super::streamer::Streamer;
use crate::clock::{HybridClock, SimulatedClock};
use crate::storage::{OriginId, SegmentLayout, SegmentTable, SessionId, Version};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// How simulated nodes are connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Every pair of nodes
    Mesh,
    /// 0-1, 1-2, ... ; writes reach the far end only by forwarding
    Line,
}

/// Configuration for a convergence DST run
#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    pub seed: u64,
    pub num_nodes: usize,
    pub topology: Topology,
    pub segments: usize,
    /// Odd-numbered nodes run twice as many segments
    pub mixed_segments: bool,
    pub key_space: usize,
    pub retain_records: usize,
    /// Small values force log gaps and inline re-snapshots
    pub max_records: usize,
    pub batch_size: usize,
    /// Probability a delivered data frame is delivered twice
    pub duplicate_prob: f64,
    /// Probability per step that a random live connection drops
    pub disconnect_prob: f64,
    /// Largest initial clock offset between nodes
    pub clock_skew_ms: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig {
            seed: 0,
            num_nodes: 3,
            topology: Topology::Mesh,
            segments: 4,
            mixed_segments: false,
            key_space: 32,
            retain_records: 1024,
            max_records: 4096,
            batch_size: 16,
            duplicate_prob: 0.0,
            disconnect_prob: 0.0,
            clock_skew_ms: 0,
        }
    }
}

impl ConvergenceConfig {
    pub fn new(seed: u64, num_nodes: usize) -> Self {
        ConvergenceConfig {
            seed,
            num_nodes,
            ..Default::default()
        }
    }

    /// No faults, full mesh
    pub fn calm(seed: u64) -> Self {
        ConvergenceConfig {
            seed,
            ..Default::default()
        }
    }

    /// Occasional duplicates and disconnects, logs small enough to gap
    pub fn moderate(seed: u64) -> Self {
        ConvergenceConfig {
            seed,
            num_nodes: 4,
            retain_records: 16,
            max_records: 64,
            duplicate_prob: 0.05,
            disconnect_prob: 0.02,
            clock_skew_ms: 50,
            ..Default::default()
        }
    }

    /// Multi-hop forwarding, tiny logs, frequent faults, mixed layouts
    pub fn chaos(seed: u64) -> Self {
        ConvergenceConfig {
            seed,
            num_nodes: 5,
            topology: Topology::Line,
            segments: 2,
            mixed_segments: true,
            key_space: 16,
            retain_records: 2,
            max_records: 8,
            batch_size: 4,
            duplicate_prob: 0.2,
            disconnect_prob: 0.05,
            clock_skew_ms: 500,
        }
    }
}

/// Result of a convergence DST run
#[derive(Debug, Clone)]
pub struct ConvergenceResult {
    pub seed: u64,
    pub writes: u64,
    pub frames_delivered: u64,
    pub duplicates_injected: u64,
    pub disconnects: u64,
    /// SNAPSHOT_DONE frames sent: full bootstraps plus inline re-snapshots
    pub snapshots: u64,
    pub invariant_violations: Vec<String>,
    pub converged: bool,
}

impl ConvergenceResult {
    pub fn new(seed: u64) -> Self {
        ConvergenceResult {
            seed,
            writes: 0,
            frames_delivered: 0,
            duplicates_injected: 0,
            disconnects: 0,
            snapshots: 0,
            invariant_violations: Vec::new(),
            converged: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty() && self.converged
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} writes, {} frames, {} dups, {} disconnects, {} snapshots, converged={}, {} violations",
            self.seed,
            self.writes,
            self.frames_delivered,
            self.duplicates_injected,
            self.disconnects,
            self.snapshots,
            self.converged,
            self.invariant_violations.len()
        )
    }
}

// =============================================================================
// Simulated nodes and connections
// =============================================================================

struct SimNode {
    table: Arc<SegmentTable>,
    clock: Arc<SimulatedClock>,
    directory: Arc<PeerDirectory>,
    epoch: u64,
    next_session: u64,
}

impl SimNode {
    fn hello_for(&self, peer: OriginId) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            origin: self.table.origin(),
            epoch: self.epoch,
            segments: self.table.segment_count() as u32,
            name: format!("sim-{}", self.table.origin()),
            resume: self.directory.resume_for(peer),
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }
}

/// One node's half of a live connection
struct End {
    node: usize,
    session: SessionId,
    streamer: Streamer,
    receiver: Receiver,
    link: SessionLink,
}

struct LiveConnection {
    ends: [End; 2],
    /// in_flight[d]: frames sent by ends[d], not yet read by the other end
    in_flight: [VecDeque<Frame>; 2],
}

struct Connection {
    nodes: (usize, usize),
    live: Option<LiveConnection>,
}

// =============================================================================
// Harness
// =============================================================================

pub struct ConvergenceHarness {
    config: ConvergenceConfig,
    rng: ChaCha8Rng,
    nodes: Vec<SimNode>,
    connections: Vec<Connection>,
    /// Highest version issued per key, with its value (None = removed)
    oracle: BTreeMap<Bytes, (Version, Option<Bytes>)>,
    result: ConvergenceResult,
}

impl ConvergenceHarness {
    pub fn new(config: ConvergenceConfig) -> Self {
        debug_assert!(config.num_nodes >= 2, "Precondition: need at least two nodes");
        debug_assert!(config.num_nodes < 256, "Precondition: node ids are u8");

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let nodes = (0..config.num_nodes)
            .map(|i| {
                let skew = if config.clock_skew_ms > 0 {
                    rng.gen_range(0..=config.clock_skew_ms)
                } else {
                    0
                };
                let clock = Arc::new(SimulatedClock::new(1_000_000 + skew));
                let segments = if config.mixed_segments && i % 2 == 1 {
                    config.segments * 2
                } else {
                    config.segments
                };
                let layout = SegmentLayout {
                    max_entries: config.key_space,
                    chunk_count: config.key_space * 8,
                    chunk_size: 64,
                    retain_records: config.retain_records,
                    max_records: config.max_records,
                };
                let table = Arc::new(SegmentTable::new(
                    OriginId(i as u8 + 1),
                    Arc::new(HybridClock::new(clock.clone())),
                    segments,
                    layout,
                ));
                SimNode {
                    table,
                    clock,
                    directory: Arc::new(PeerDirectory::new()),
                    epoch: rng.gen(),
                    next_session: 0,
                }
            })
            .collect();

        let n = config.num_nodes;
        let pairs: Vec<(usize, usize)> = match config.topology {
            Topology::Mesh => (0..n)
                .flat_map(|a| ((a + 1)..n).map(move |b| (a, b)))
                .collect(),
            Topology::Line => (0..n - 1).map(|a| (a, a + 1)).collect(),
        };
        let connections = pairs
            .into_iter()
            .map(|nodes| Connection { nodes, live: None })
            .collect();

        let mut harness = ConvergenceHarness {
            result: ConvergenceResult::new(config.seed),
            config,
            rng,
            nodes,
            connections,
            oracle: BTreeMap::new(),
        };
        for idx in 0..harness.connections.len() {
            harness.connect(idx);
        }
        harness
    }

    /// Run random steps: writes, partial pumps, clock ticks and faults
    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            let roll: f64 = self.rng.gen();
            if roll < self.config.disconnect_prob {
                self.random_disconnect();
            } else if roll < 0.45 {
                self.random_write();
            } else if roll < 0.9 {
                let idx = self.rng.gen_range(0..self.connections.len());
                let direction = self.rng.gen_range(0..2);
                let budget = self.rng.gen_range(1..=8);
                self.pump(idx, direction, Some(budget));
            } else if roll < 0.95 {
                let idx = self.rng.gen_range(0..self.connections.len());
                if self.connections[idx].live.is_none() {
                    self.connect(idx);
                }
            } else {
                let node = self.rng.gen_range(0..self.nodes.len());
                let ms = self.rng.gen_range(0..5);
                self.nodes[node].clock.advance_ms(ms);
            }
        }
    }

    /// Reconnect everything and pump until no connection has work left
    pub fn quiesce(&mut self) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].live.is_none() {
                self.connect(idx);
            }
        }

        let max_rounds = 10_000;
        for _ in 0..max_rounds {
            let mut moved = 0;
            for idx in 0..self.connections.len() {
                for direction in 0..2 {
                    moved += self.pump(idx, direction, None);
                }
            }
            if moved == 0 {
                return;
            }
        }
        self.result
            .invariant_violations
            .push(format!("No quiescence after {} rounds", max_rounds));
    }

    /// Every node must match the oracle, and every session must be streaming
    pub fn check_convergence(&mut self) {
        let expected: Vec<(Bytes, Bytes)> = self
            .oracle
            .iter()
            .filter_map(|(k, (_, v))| v.clone().map(|v| (k.clone(), v)))
            .collect();

        for (i, node) in self.nodes.iter().enumerate() {
            let mut actual = match node.table.entries() {
                Ok(entries) => entries,
                Err(e) => {
                    self.result
                        .invariant_violations
                        .push(format!("Node {} entries failed: {}", i, e));
                    continue;
                }
            };
            actual.sort();
            if actual != expected {
                self.result.invariant_violations.push(format!(
                    "Node {} holds {} live entries, oracle has {}",
                    i,
                    actual.len(),
                    expected.len()
                ));
            }
            for (key, (version, _)) in &self.oracle {
                let stored = node.table.version_of(key);
                if stored != Some(*version) {
                    self.result.invariant_violations.push(format!(
                        "Node {} key {:?}: version {:?}, oracle {:?}",
                        i, key, stored, version
                    ));
                }
            }
        }

        for conn in &self.connections {
            if let Some(live) = &conn.live {
                for end in &live.ends {
                    if !end.link.is_streaming() {
                        self.result.invariant_violations.push(format!(
                            "Session {:?} on node {} never finished bootstrap",
                            end.session, end.node
                        ));
                    }
                }
            }
        }

        self.result.converged = self.result.invariant_violations.is_empty();
    }

    pub fn result(&self) -> &ConvergenceResult {
        &self.result
    }

    pub fn into_result(self) -> ConvergenceResult {
        self.result
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    fn random_write(&mut self) {
        let node = self.rng.gen_range(0..self.nodes.len());
        let key = Bytes::from(format!("key:{}", self.rng.gen_range(0..self.config.key_space)));
        let table = self.nodes[node].table.clone();

        let outcome = if self.rng.gen_bool(0.7) {
            let value = Bytes::from(format!("v{}:{}", node, self.rng.gen::<u32>()));
            table.put(key.clone(), value).map(|_| ())
        } else {
            table.remove(&key).map(|_| ())
        };
        if let Err(e) = outcome {
            self.result
                .invariant_violations
                .push(format!("Local write on node {} failed: {}", node, e));
            return;
        }
        self.result.writes += 1;

        if let Some(version) = table.version_of(&key) {
            let value = match table.get(&key) {
                Ok(value) => value,
                Err(_) => return,
            };
            let newer = self
                .oracle
                .get(&key)
                .map_or(true, |(current, _)| version > *current);
            if newer {
                self.oracle.insert(key, (version, value));
            }
        }
    }

    fn random_disconnect(&mut self) {
        let live: Vec<usize> = (0..self.connections.len())
            .filter(|&i| self.connections[i].live.is_some())
            .collect();
        if live.is_empty() {
            return;
        }
        let idx = live[self.rng.gen_range(0..live.len())];
        self.disconnect(idx);
    }

    fn disconnect(&mut self, idx: usize) {
        if let Some(live) = self.connections[idx].live.take() {
            for end in &live.ends {
                self.nodes[end.node].table.unregister(end.session);
            }
            self.result.disconnects += 1;
        }
    }

    /// Handshake both ends the way a TCP session does
    fn connect(&mut self, idx: usize) {
        let (a, b) = self.connections[idx].nodes;
        let hello_a = self.nodes[a].hello_for(self.nodes[b].table.origin());
        let hello_b = self.nodes[b].hello_for(self.nodes[a].table.origin());
        self.nodes[a].directory.observe_hello(&hello_b);
        self.nodes[b].directory.observe_hello(&hello_a);

        let end_a = self.open_end(a, &hello_b);
        let end_b = self.open_end(b, &hello_a);
        self.connections[idx].live = Some(LiveConnection {
            ends: [end_a, end_b],
            in_flight: [VecDeque::new(), VecDeque::new()],
        });
    }

    fn open_end(&mut self, node: usize, peer_hello: &Hello) -> End {
        let batch_size = self.config.batch_size;
        let n = &mut self.nodes[node];
        let session = n.next_session_id();
        let streamer = Streamer::new(n.table.clone(), session, n.epoch, peer_hello, batch_size);
        let link = SessionLink::new();
        if !streamer.is_bootstrapping() {
            link.mark_streaming();
        }
        let receiver = Receiver::new(n.table.clone(), n.directory.clone(), session, peer_hello);
        End {
            node,
            session,
            streamer,
            receiver,
            link,
        }
    }

    /// Let ends[direction] write, then deliver up to `budget` of its frames.
    /// Returns frames produced plus frames delivered.
    fn pump(&mut self, idx: usize, direction: usize, budget: Option<usize>) -> usize {
        let duplicate_prob = self.config.duplicate_prob;
        let Some(live) = self.connections[idx].live.as_mut() else {
            return 0;
        };
        let mut moved = 0;

        // Writer side
        let sender = &mut live.ends[direction];
        if let Some(acks) = sender.link.take_acks() {
            live.in_flight[direction].push_back(Frame::Ack { acks });
            moved += 1;
        }
        match sender.streamer.next_batch() {
            Ok(frames) => {
                for frame in frames {
                    if let Frame::SnapshotDone { cursors } = &frame {
                        sender.link.expect_bootstrap_acks(cursors);
                        self.result.snapshots += 1;
                    }
                    live.in_flight[direction].push_back(frame);
                    moved += 1;
                }
            }
            Err(e) => {
                self.result
                    .invariant_violations
                    .push(format!("Streamer on node {} failed: {}", sender.node, e));
                return moved;
            }
        }

        // Reader side
        let limit = budget.unwrap_or(usize::MAX);
        let reader = &mut live.ends[1 - direction];
        let mut delivered = 0;
        while delivered < limit {
            let Some(frame) = live.in_flight[direction].pop_front() else {
                break;
            };
            let duplicate = matches!(frame, Frame::SnapshotEntry(_) | Frame::Delta { .. })
                && self.rng.gen_bool(duplicate_prob);
            let copy = duplicate.then(|| frame.clone());

            if let Err(e) = reader.receiver.handle(frame, &reader.link) {
                self.result
                    .invariant_violations
                    .push(format!("Receiver on node {} failed: {}", reader.node, e));
                return moved;
            }
            if let Some(copy) = copy {
                self.result.duplicates_injected += 1;
                if let Err(e) = reader.receiver.handle(copy, &reader.link) {
                    self.result.invariant_violations.push(format!(
                        "Duplicate on node {} failed: {}",
                        reader.node, e
                    ));
                    return moved;
                }
            }
            delivered += 1;
        }
        self.result.frames_delivered += delivered as u64;
        moved + delivered
    }
}

// =============================================================================
// Batch Runners
// =============================================================================

/// Run `count` seeds starting at `base_seed`
pub fn run_convergence_batch(
    base_seed: u64,
    count: usize,
    steps_per_run: usize,
    config_fn: impl Fn(u64) -> ConvergenceConfig,
) -> Vec<ConvergenceResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = ConvergenceHarness::new(config_fn(seed));
        harness.run(steps_per_run);
        harness.quiesce();
        harness.check_convergence();
        results.push(harness.into_result());
    }

    results
}

pub fn summarize_batch(results: &[ConvergenceResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let writes: u64 = results.iter().map(|r| r.writes).sum();
    let frames: u64 = results.iter().map(|r| r.frames_delivered).sum();
    let disconnects: u64 = results.iter().map(|r| r.disconnects).sum();
    let snapshots: u64 = results.iter().map(|r| r.snapshots).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} writes, {} frames, {} disconnects, {} snapshots",
        passed, total, writes, frames, disconnects, snapshots
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
