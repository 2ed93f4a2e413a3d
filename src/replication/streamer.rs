//! Outbound Replication Stream
//!
//! The streamer turns this node's table into frames for one peer. At
//! session start it decides, per segment, whether the peer can resume from
//! the cursor it offered in HELLO or needs that segment's snapshot:
//!
//! ```text
//! resume(s) iff  peer_epoch == our epoch
//!           and  cursors.len() == our segment count
//!           and  records after cursors[s] are still in segment s's log
//! ```
//!
//! Each `next_batch` call then yields up to `batch_size` deltas per resumed
//! segment plus snapshots of queued segments until one of them produced
//! frames, followed by SNAPSHOT_DONE once no snapshot is pending. A log gap mid-stream queues that
//! segment for an inline re-snapshot.
//!
//! Registering with the log happens inside `try_resume`/`snapshot_segment`
//! under the segment lock, so nothing between the snapshot head and the
//! first delta can be reclaimed.

use super::frame::{Frame, Hello};
use super::session::SessionError;
use crate::storage::{SegmentTable, SessionId, StoreError};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Streamer {
    table: Arc<SegmentTable>,
    session: SessionId,
    /// Next seq to send per local segment
    next: Vec<u64>,
    /// Segments awaiting a snapshot
    snapshot_queue: VecDeque<usize>,
    in_snapshot: Vec<bool>,
    /// A snapshot was sent and SNAPSHOT_DONE has not followed yet
    snapshot_open: bool,
    batch_size: usize,
}

impl Streamer {
    /// Plan a session for the peer that sent `peer_hello`
    pub fn new(
        table: Arc<SegmentTable>,
        session: SessionId,
        local_epoch: u64,
        peer_hello: &Hello,
        batch_size: usize,
    ) -> Self {
        debug_assert!(batch_size > 0, "Precondition: batch_size must be positive");
        let segments = table.segment_count();

        let offered = peer_hello
            .resume
            .as_ref()
            .filter(|r| r.peer_epoch == local_epoch && r.cursors.len() == segments);

        let mut next = vec![1; segments];
        let mut snapshot_queue = VecDeque::new();
        let mut in_snapshot = vec![false; segments];
        for segment in 0..segments {
            match offered {
                Some(resume) if table.try_resume(segment, session, resume.cursors[segment]) => {
                    next[segment] = resume.cursors[segment] + 1;
                }
                _ => {
                    snapshot_queue.push_back(segment);
                    in_snapshot[segment] = true;
                }
            }
        }

        debug!(
            peer = %peer_hello.origin,
            session = session.0,
            resumed = segments - snapshot_queue.len(),
            snapshot = snapshot_queue.len(),
            "Planned outbound stream"
        );

        Streamer {
            table,
            session,
            next,
            snapshot_queue,
            in_snapshot,
            snapshot_open: false,
            batch_size,
        }
    }

    /// True while any segment still has to be snapshotted
    pub fn is_bootstrapping(&self) -> bool {
        !self.snapshot_queue.is_empty() || self.snapshot_open
    }

    /// Last seq covered per segment
    pub fn cursors(&self) -> Vec<u64> {
        self.next.iter().map(|n| n - 1).collect()
    }

    /// Frames ready to send. Empty means fully drained.
    pub fn next_batch(&mut self) -> Result<Vec<Frame>, SessionError> {
        let mut frames = Vec::new();

        for segment in 0..self.next.len() {
            if self.in_snapshot[segment] {
                continue;
            }
            match self
                .table
                .read_log(segment, self.next[segment], self.batch_size)
            {
                Ok(records) => {
                    for record in records {
                        self.next[segment] = record.seq + 1;
                        frames.push(Frame::Delta {
                            segment: record.segment,
                            seq: record.seq,
                            entry: record.entry,
                        });
                    }
                }
                Err(gap) => {
                    warn!(session = self.session.0, %gap, "Peer fell behind log, re-sending segment");
                    self.in_snapshot[segment] = true;
                    self.snapshot_queue.push_back(segment);
                }
            }
        }

        // An empty batch must mean nothing is pending: empty snapshots do
        // not end the batch
        while let Some(segment) = self.snapshot_queue.pop_front() {
            let snapshot = self
                .table
                .snapshot_segment(segment, self.session)
                .map_err(|e| match e {
                    StoreError::Closed => SessionError::Cancelled,
                    other => SessionError::Protocol(other.to_string()),
                })?;
            frames.extend(snapshot.entries.into_iter().map(Frame::SnapshotEntry));
            self.next[segment] = snapshot.head + 1;
            self.in_snapshot[segment] = false;
            self.snapshot_open = true;
            if !frames.is_empty() {
                break;
            }
        }

        if self.snapshot_open && self.snapshot_queue.is_empty() {
            self.snapshot_open = false;
            frames.push(Frame::SnapshotDone {
                cursors: self.cursors(),
            });
        }

        Ok(frames)
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("session", &self.session)
            .field("next", &self.next)
            .field("snapshot_queue", &self.snapshot_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HybridClock, SimulatedClock};
    use crate::replication::frame::{ResumeCursors, PROTOCOL_VERSION};
    use crate::storage::{OriginId, SegmentLayout};
    use bytes::Bytes;

    const EPOCH: u64 = 1234;

    fn table(segments: usize, retain: usize, max: usize) -> Arc<SegmentTable> {
        let clock = Arc::new(HybridClock::new(Arc::new(SimulatedClock::new(100))));
        Arc::new(SegmentTable::new(
            OriginId(1),
            clock,
            segments,
            SegmentLayout {
                max_entries: 256,
                chunk_count: 1024,
                chunk_size: 64,
                retain_records: retain,
                max_records: max,
            },
        ))
    }

    fn hello(resume: Option<ResumeCursors>) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            origin: OriginId(2),
            epoch: 99,
            segments: 4,
            name: "peer".to_string(),
            resume,
        }
    }

    fn put(t: &SegmentTable, n: usize) {
        t.put(Bytes::from(format!("k{}", n)), Bytes::from_static(b"v"))
            .unwrap();
    }

    fn drain(streamer: &mut Streamer) -> Vec<Frame> {
        let mut all = Vec::new();
        loop {
            let batch = streamer.next_batch().unwrap();
            if batch.is_empty() {
                return all;
            }
            all.extend(batch);
        }
    }

    #[test]
    fn test_fresh_peer_gets_full_snapshot_then_done() {
        let t = table(2, 64, 1024);
        for n in 0..10 {
            put(&t, n);
        }
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(None), 16);
        assert!(streamer.is_bootstrapping());

        let frames = drain(&mut streamer);
        let entries = frames
            .iter()
            .filter(|f| matches!(f, Frame::SnapshotEntry(_)))
            .count();
        assert_eq!(entries, 10);
        assert!(matches!(frames.last(), Some(Frame::SnapshotDone { .. })));
        assert!(!streamer.is_bootstrapping());

        let heads: Vec<u64> = (0..2).map(|s| t.head_seq(s)).collect();
        assert_eq!(streamer.cursors(), heads);
    }

    #[test]
    fn test_writes_after_snapshot_stream_as_deltas() {
        let t = table(2, 64, 1024);
        put(&t, 0);
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(None), 16);
        drain(&mut streamer);

        put(&t, 1);
        t.remove(b"k0").unwrap();
        let frames = drain(&mut streamer);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| matches!(f, Frame::Delta { .. })));
    }

    #[test]
    fn test_valid_cursors_resume_without_snapshot() {
        let t = table(2, 64, 1024);
        for n in 0..6 {
            put(&t, n);
        }
        let cursors: Vec<u64> = (0..2).map(|s| t.head_seq(s)).collect();
        for n in 6..9 {
            put(&t, n);
        }

        let resume = ResumeCursors {
            peer_epoch: EPOCH,
            cursors,
        };
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(Some(resume)), 16);
        assert!(!streamer.is_bootstrapping());

        let frames = drain(&mut streamer);
        assert_eq!(frames.len(), 3, "Only the writes after the cursors are sent");
        assert!(frames.iter().all(|f| matches!(f, Frame::Delta { .. })));
    }

    #[test]
    fn test_wrong_epoch_forces_snapshot() {
        let t = table(2, 64, 1024);
        put(&t, 0);
        let resume = ResumeCursors {
            peer_epoch: EPOCH + 1,
            cursors: vec![0, 0],
        };
        let streamer = Streamer::new(t, SessionId(1), EPOCH, &hello(Some(resume)), 16);
        assert!(streamer.is_bootstrapping());
    }

    #[test]
    fn test_segment_count_mismatch_forces_snapshot() {
        let t = table(2, 64, 1024);
        let resume = ResumeCursors {
            peer_epoch: EPOCH,
            cursors: vec![0, 0, 0],
        };
        let streamer = Streamer::new(t, SessionId(1), EPOCH, &hello(Some(resume)), 16);
        assert!(streamer.is_bootstrapping());
    }

    #[test]
    fn test_reclaimed_cursor_snapshots_only_that_segment() {
        let t = table(1, 2, 1024);
        for n in 0..10 {
            put(&t, n);
        }
        // retain_records = 2: cursor 3 is long gone
        let resume = ResumeCursors {
            peer_epoch: EPOCH,
            cursors: vec![3],
        };
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(Some(resume)), 16);
        assert!(streamer.is_bootstrapping());
        let frames = drain(&mut streamer);
        assert_eq!(
            frames
                .iter()
                .filter(|f| matches!(f, Frame::SnapshotEntry(_)))
                .count(),
            10
        );
    }

    #[test]
    fn test_gap_mid_stream_triggers_inline_snapshot() {
        // Hard cap of 4 records while the session is pinning the log
        let t = table(1, 0, 4);
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(None), 16);
        drain(&mut streamer);

        for n in 0..8 {
            put(&t, n);
        }
        let frames = drain(&mut streamer);
        let snapshot_entries = frames
            .iter()
            .filter(|f| matches!(f, Frame::SnapshotEntry(_)))
            .count();
        assert_eq!(snapshot_entries, 8);
        assert!(matches!(frames.last(), Some(Frame::SnapshotDone { cursors }) if cursors == &vec![8]));
    }

    #[test]
    fn test_empty_segments_complete_bootstrap_in_one_batch() {
        let t = table(4, 64, 1024);
        let mut streamer = Streamer::new(t, SessionId(1), EPOCH, &hello(None), 16);

        let batch = streamer.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0], Frame::SnapshotDone { cursors } if cursors == &vec![0; 4]));
        assert!(!streamer.is_bootstrapping());
        assert!(streamer.next_batch().unwrap().is_empty());
    }

    #[test]
    fn test_empty_batch_only_when_drained() {
        let t = table(4, 64, 1024);
        put(&t, 0);
        let mut streamer = Streamer::new(t, SessionId(1), EPOCH, &hello(None), 16);
        loop {
            let batch = streamer.next_batch().unwrap();
            if batch.is_empty() {
                break;
            }
        }
        assert!(!streamer.is_bootstrapping());
    }

    #[test]
    fn test_batches_are_bounded() {
        let t = table(1, 1024, 4096);
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(None), 4);
        drain(&mut streamer);
        for n in 0..10 {
            put(&t, n);
        }
        assert_eq!(streamer.next_batch().unwrap().len(), 4);
        assert_eq!(streamer.next_batch().unwrap().len(), 4);
        assert_eq!(streamer.next_batch().unwrap().len(), 2);
        assert!(streamer.next_batch().unwrap().is_empty());
    }

    #[test]
    fn test_closed_table_cancels() {
        let t = table(1, 16, 64);
        let mut streamer = Streamer::new(t.clone(), SessionId(1), EPOCH, &hello(None), 4);
        t.release();
        assert!(matches!(streamer.next_batch(), Err(SessionError::Cancelled)));
    }
}
