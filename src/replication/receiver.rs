//! Inbound Replication Stream
//!
//! Applies validated frames from one peer:
//!
//! - SNAPSHOT_ENTRY / DELTA_RECORD: run through the conflict resolver via
//!   `SegmentTable::apply_remote`; deltas also advance our cursor for the
//!   peer's segment and queue an ack.
//! - SNAPSHOT_DONE: adopt the peer's cursors and ack every one of them,
//!   which completes the peer's bootstrap of us.
//! - ACK: release our own log records held for this session.
//! - HEARTBEAT: nothing beyond resetting the read timeout.
//!
//! A capacity failure drops that one entry with a warning; the session
//! keeps going. Replication never fails local operations.

use super::frame::{Frame, Hello};
use super::peer::PeerDirectory;
use super::session::{SessionError, SessionLink};
use crate::storage::{Entry, OriginId, SegmentTable, SessionId, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters for one session's inbound stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub applied: u64,
    pub discarded: u64,
    pub rejected: u64,
}

pub struct Receiver {
    table: Arc<SegmentTable>,
    directory: Arc<PeerDirectory>,
    session: SessionId,
    peer: OriginId,
    peer_segments: u32,
    stats: ReceiveStats,
}

impl Receiver {
    pub fn new(
        table: Arc<SegmentTable>,
        directory: Arc<PeerDirectory>,
        session: SessionId,
        peer_hello: &Hello,
    ) -> Self {
        Receiver {
            table,
            directory,
            session,
            peer: peer_hello.origin,
            peer_segments: peer_hello.segments,
            stats: ReceiveStats::default(),
        }
    }

    pub fn stats(&self) -> ReceiveStats {
        self.stats
    }

    /// Apply one frame. Returns true if it completed the peer's bootstrap
    /// of our data (their ack of our SNAPSHOT_DONE).
    pub fn handle(&mut self, frame: Frame, link: &SessionLink) -> Result<bool, SessionError> {
        match frame {
            Frame::SnapshotEntry(entry) => {
                self.apply(entry)?;
                Ok(false)
            }
            Frame::Delta {
                segment,
                seq,
                entry,
            } => {
                if segment >= self.peer_segments {
                    return Err(SessionError::Protocol(format!(
                        "delta for segment {} of {}",
                        segment, self.peer_segments
                    )));
                }
                self.apply(entry)?;
                self.directory.advance(self.peer, segment, seq);
                link.queue_ack(segment, seq);
                Ok(false)
            }
            Frame::SnapshotDone { cursors } => {
                if cursors.len() != self.peer_segments as usize {
                    return Err(SessionError::Protocol(format!(
                        "snapshot cursors for {} segments, peer has {}",
                        cursors.len(),
                        self.peer_segments
                    )));
                }
                info!(
                    peer = %self.peer,
                    applied = self.stats.applied,
                    discarded = self.stats.discarded,
                    "Snapshot from peer complete"
                );
                self.directory.snapshot_done(self.peer, &cursors);
                for (segment, cursor) in cursors.into_iter().enumerate() {
                    link.queue_ack(segment as u32, cursor);
                }
                Ok(false)
            }
            Frame::Ack { acks } => {
                let segments = self.table.segment_count();
                let mut completed = false;
                for (segment, seq) in acks {
                    if segment as usize >= segments {
                        return Err(SessionError::Protocol(format!(
                            "ack for segment {} of {}",
                            segment, segments
                        )));
                    }
                    self.table.ack(segment as usize, self.session, seq);
                    completed |= link.on_ack(segment, seq);
                }
                if completed {
                    info!(peer = %self.peer, "Peer bootstrap complete, streaming");
                }
                Ok(completed)
            }
            Frame::Heartbeat { sent_at_ms } => {
                debug!(peer = %self.peer, sent_at_ms, "Heartbeat");
                Ok(false)
            }
            Frame::Hello(_) => Err(SessionError::Protocol(
                "HELLO after handshake".to_string(),
            )),
        }
    }

    fn apply(&mut self, entry: Entry) -> Result<(), SessionError> {
        match self.table.apply_remote(entry) {
            Ok(resolution) if resolution.is_apply() => self.stats.applied += 1,
            Ok(_) => self.stats.discarded += 1,
            Err(StoreError::Closed) => return Err(SessionError::Cancelled),
            Err(e) => {
                self.stats.rejected += 1;
                warn!(peer = %self.peer, error = %e, "Dropping replicated entry");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("peer", &self.peer)
            .field("session", &self.session)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HybridClock, SimulatedClock};
    use crate::replication::frame::PROTOCOL_VERSION;
    use crate::storage::{SegmentLayout, Version};
    use bytes::Bytes;

    fn table(max_entries: usize) -> Arc<SegmentTable> {
        let clock = Arc::new(HybridClock::new(Arc::new(SimulatedClock::new(0))));
        Arc::new(SegmentTable::new(
            OriginId(1),
            clock,
            1,
            SegmentLayout {
                max_entries,
                chunk_count: 256,
                chunk_size: 64,
                retain_records: 64,
                max_records: 1024,
            },
        ))
    }

    fn peer_hello() -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            origin: OriginId(2),
            epoch: 5,
            segments: 2,
            name: "peer".to_string(),
            resume: None,
        }
    }

    fn receiver(t: &Arc<SegmentTable>, dir: &Arc<PeerDirectory>) -> Receiver {
        dir.observe_hello(&peer_hello());
        Receiver::new(t.clone(), dir.clone(), SessionId(1), &peer_hello())
    }

    fn delta(segment: u32, seq: u64, key: &'static [u8], ts: u64) -> Frame {
        Frame::Delta {
            segment,
            seq,
            entry: Entry::live(
                Bytes::from_static(key),
                Bytes::from_static(b"v"),
                Version::new(ts, OriginId(2)),
            ),
        }
    }

    #[test]
    fn test_delta_applies_advances_cursor_and_queues_ack() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();

        rx.handle(delta(1, 7, b"k", 10), &link).unwrap();
        assert_eq!(t.get(b"k").unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(dir.cursors(OriginId(2)), Some(vec![0, 7]));
        assert_eq!(link.take_acks(), Some(vec![(1, 7)]));
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();

        rx.handle(delta(0, 1, b"k", 10), &link).unwrap();
        let head = t.head_seq(0);
        rx.handle(delta(0, 1, b"k", 10), &link).unwrap();

        assert_eq!(t.head_seq(0), head, "Discarded duplicates are not re-logged");
        assert_eq!(rx.stats().applied, 1);
        assert_eq!(rx.stats().discarded, 1);
    }

    #[test]
    fn test_snapshot_done_adopts_cursors_and_acks_all() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();

        rx.handle(
            Frame::SnapshotDone {
                cursors: vec![4, 9],
            },
            &link,
        )
        .unwrap();
        assert_eq!(link.take_acks(), Some(vec![(0, 4), (1, 9)]));
        let resume = dir.resume_for(OriginId(2)).unwrap();
        assert_eq!(resume.cursors, vec![4, 9]);
    }

    #[test]
    fn test_ack_completes_bootstrap() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();
        link.expect_bootstrap_acks(&[0]);

        let done = rx
            .handle(Frame::Ack { acks: vec![(0, 0)] }, &link)
            .unwrap();
        assert!(done);
        assert!(link.is_streaming());
    }

    #[test]
    fn test_out_of_range_segments_rejected() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();

        assert!(matches!(
            rx.handle(delta(5, 1, b"k", 1), &link),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            rx.handle(Frame::Ack { acks: vec![(3, 1)] }, &link),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            rx.handle(Frame::SnapshotDone { cursors: vec![1] }, &link),
            Err(SessionError::Protocol(_))
        ));
        assert_eq!(t.get(b"k").unwrap(), None, "Rejected frame must not be applied");
    }

    #[test]
    fn test_capacity_failure_is_not_fatal() {
        let t = table(1);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();

        rx.handle(delta(0, 1, b"a", 1), &link).unwrap();
        rx.handle(delta(0, 2, b"b", 2), &link).unwrap();
        assert_eq!(rx.stats().rejected, 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_hello_after_handshake_rejected() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();
        assert!(rx.handle(Frame::Hello(peer_hello()), &link).is_err());
    }

    #[test]
    fn test_closed_table_cancels_session() {
        let t = table(16);
        let dir = Arc::new(PeerDirectory::new());
        let mut rx = receiver(&t, &dir);
        let link = SessionLink::new();
        t.release();
        assert!(matches!(
            rx.handle(delta(0, 1, b"k", 1), &link),
            Err(SessionError::Cancelled)
        ));
    }
}
