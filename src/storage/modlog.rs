//! Per-Segment Modification Log
//!
//! Every mutation applied to a segment (local or accepted from a peer) is
//! appended here under the segment lock, so log order is exactly table
//! mutation order. Peer sessions read the log from their own cursor and
//! acknowledge what the remote side has applied.
//!
//! ## Reclamation
//!
//! ```text
//! first_seq                           head
//!    │  acked by every registered     │
//!    ▼  session (reclaimable)         ▼
//!    [r5][r6][r7][r8][r9][r10][r11][r12]
//!              ▲
//!              min_unacked_seq
//! ```
//!
//! - Only registered (connected) sessions hold records back.
//! - Up to `retain_records` acknowledged records are kept so a peer that
//!   drops briefly can resume from its cursor instead of re-bootstrapping.
//! - `max_records` is a hard cap. A session that falls further behind loses
//!   its records and sees a `LogGap` on its next read.

use super::entry::Entry;
use std::collections::{HashMap, VecDeque};

/// Identifies one peer session reading the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub segment: u32,
    pub seq: u64,
    pub entry: Entry,
}

/// Requested records were already reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGap {
    pub segment: u32,
    pub requested: u64,
    pub first_available: u64,
}

impl std::fmt::Display for LogGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segment {} log gap: requested seq {}, first available {}",
            self.segment, self.requested, self.first_available
        )
    }
}

impl std::error::Error for LogGap {}

#[derive(Debug)]
pub struct ModificationLog {
    segment: u32,
    records: VecDeque<LogRecord>,
    /// Seq of the newest record ever appended (0 = none)
    head: u64,
    /// Last seq acknowledged by each registered session
    acks: HashMap<SessionId, u64>,
    retain_records: usize,
    max_records: usize,
}

impl ModificationLog {
    pub fn new(segment: u32, retain_records: usize, max_records: usize) -> Self {
        debug_assert!(
            retain_records <= max_records,
            "Precondition: retain_records must not exceed max_records"
        );
        ModificationLog {
            segment,
            records: VecDeque::new(),
            head: 0,
            acks: HashMap::new(),
            retain_records,
            max_records,
        }
    }

    /// Seq of the newest appended record (0 before the first append)
    pub fn head_seq(&self) -> u64 {
        self.head
    }

    /// Seq of the oldest retained record, or `head + 1` when empty
    pub fn first_seq(&self) -> u64 {
        self.records.front().map_or(self.head + 1, |r| r.seq)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append the next mutation, returning its seq
    pub fn append(&mut self, entry: Entry) -> u64 {
        self.head += 1;
        let seq = self.head;
        self.records.push_back(LogRecord {
            segment: self.segment,
            seq,
            entry,
        });
        self.reclaim();

        // With nothing retained and no session registered the new record
        // may already be reclaimed
        debug_assert_eq!(self.head, seq, "Postcondition: head must advance to seq");
        debug_assert!(
            self.records.back().map_or(true, |r| r.seq == seq),
            "Postcondition: appended record must be the tail"
        );
        seq
    }

    /// Records with seq >= `from`, oldest first
    pub fn read_from(&self, from: u64) -> Result<impl Iterator<Item = &LogRecord> + '_, LogGap> {
        let first = self.first_seq();
        if from < first {
            return Err(LogGap {
                segment: self.segment,
                requested: from,
                first_available: first,
            });
        }
        let skip = (from - first) as usize;
        Ok(self.records.iter().skip(skip))
    }

    /// Could a reader that has applied everything up to `cursor` continue
    /// from `cursor + 1` without missing records?
    pub fn can_resume_from(&self, cursor: u64) -> bool {
        cursor <= self.head && cursor + 1 >= self.first_seq()
    }

    /// Start holding records back for `session`, which has applied up to `acked`
    pub fn register(&mut self, session: SessionId, acked: u64) {
        debug_assert!(acked <= self.head, "Precondition: cannot ack beyond head");
        self.acks.insert(session, acked);
    }

    pub fn unregister(&mut self, session: SessionId) {
        if self.acks.remove(&session).is_some() {
            self.reclaim();
        }
    }

    /// Record that `session` has applied everything up to `seq`
    pub fn ack_up_to(&mut self, session: SessionId, seq: u64) {
        let Some(acked) = self.acks.get_mut(&session) else {
            return;
        };
        // Acks never move backwards and never pass the head
        let seq = seq.min(self.head);
        if seq > *acked {
            *acked = seq;
            self.reclaim();
        }
    }

    /// Lowest seq not yet acknowledged by every registered session
    pub fn min_unacked_seq(&self) -> u64 {
        self.acks
            .values()
            .map(|acked| acked + 1)
            .min()
            .unwrap_or(self.head + 1)
    }

    pub fn registered_sessions(&self) -> usize {
        self.acks.len()
    }

    /// Drop every record and registration
    pub fn clear(&mut self) {
        self.records = VecDeque::new();
        self.acks.clear();
    }

    fn reclaim(&mut self) {
        let min_unacked = self.min_unacked_seq();
        while self.records.len() > self.retain_records {
            match self.records.front() {
                Some(front) if front.seq < min_unacked => {
                    self.records.pop_front();
                }
                _ => break,
            }
        }

        // Hard cap: laggards will observe a gap
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entry::{OriginId, Version};
    use bytes::Bytes;

    fn entry(n: u64) -> Entry {
        Entry::live(
            Bytes::from(format!("k{}", n)),
            Bytes::from(format!("v{}", n)),
            Version::new(n, OriginId(1)),
        )
    }

    fn seqs(log: &ModificationLog, from: u64) -> Vec<u64> {
        log.read_from(from).unwrap().map(|r| r.seq).collect()
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let mut log = ModificationLog::new(0, 100, 1000);
        assert_eq!(log.head_seq(), 0);
        assert_eq!(log.first_seq(), 1);

        assert_eq!(log.append(entry(1)), 1);
        assert_eq!(log.append(entry(2)), 2);
        assert_eq!(log.head_seq(), 2);
        assert_eq!(seqs(&log, 1), vec![1, 2]);
    }

    #[test]
    fn test_zero_retention_reclaims_on_append() {
        let mut log = ModificationLog::new(0, 0, 16);
        assert_eq!(log.append(entry(1)), 1);
        assert_eq!(log.append(entry(2)), 2);
        assert!(log.is_empty());
        assert_eq!(log.head_seq(), 2);
        assert_eq!(log.first_seq(), 3);
        assert!(log.can_resume_from(2));
        assert!(log.read_from(1).is_err());
    }

    #[test]
    fn test_read_from_is_restartable() {
        let mut log = ModificationLog::new(3, 100, 1000);
        for n in 1..=5 {
            log.append(entry(n));
        }
        assert_eq!(seqs(&log, 4), vec![4, 5]);
        assert_eq!(seqs(&log, 2), vec![2, 3, 4, 5]);
        assert_eq!(seqs(&log, 6), Vec::<u64>::new());

        let record = log.read_from(5).unwrap().next().unwrap();
        assert_eq!(record.segment, 3);
        assert_eq!(record.entry, entry(5));
    }

    #[test]
    fn test_unacked_records_are_retained_for_registered_session() {
        let mut log = ModificationLog::new(0, 0, 1000);
        let session = SessionId(1);
        log.register(session, 0);

        for n in 1..=10 {
            log.append(entry(n));
        }
        assert_eq!(log.len(), 10);
        assert_eq!(log.min_unacked_seq(), 1);

        log.ack_up_to(session, 6);
        assert_eq!(log.min_unacked_seq(), 7);
        assert_eq!(log.first_seq(), 7, "Acked records are reclaimed");
        assert_eq!(seqs(&log, 7), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_slowest_session_pins_the_log() {
        let mut log = ModificationLog::new(0, 0, 1000);
        log.register(SessionId(1), 0);
        log.register(SessionId(2), 0);
        for n in 1..=5 {
            log.append(entry(n));
        }

        log.ack_up_to(SessionId(1), 5);
        assert_eq!(log.first_seq(), 1);

        log.ack_up_to(SessionId(2), 3);
        assert_eq!(log.first_seq(), 4);
        assert_eq!(log.min_unacked_seq(), 4);
    }

    #[test]
    fn test_ack_never_moves_backwards() {
        let mut log = ModificationLog::new(0, 0, 1000);
        log.register(SessionId(1), 0);
        for n in 1..=5 {
            log.append(entry(n));
        }
        log.ack_up_to(SessionId(1), 4);
        log.ack_up_to(SessionId(1), 2);
        assert_eq!(log.min_unacked_seq(), 5);
    }

    #[test]
    fn test_ack_from_unregistered_session_is_ignored() {
        let mut log = ModificationLog::new(0, 0, 1000);
        log.register(SessionId(1), 0);
        log.append(entry(1));
        log.ack_up_to(SessionId(99), 1);
        assert_eq!(log.min_unacked_seq(), 1);
    }

    #[test]
    fn test_retention_window_keeps_recent_acked_records() {
        let mut log = ModificationLog::new(0, 3, 1000);
        for n in 1..=10 {
            log.append(entry(n));
        }
        // No sessions: everything is acked, but the window keeps 3
        assert_eq!(log.len(), 3);
        assert_eq!(log.first_seq(), 8);
        assert!(log.can_resume_from(7));
        assert!(!log.can_resume_from(6));
    }

    #[test]
    fn test_hard_cap_creates_gap_for_laggard() {
        let mut log = ModificationLog::new(2, 0, 4);
        log.register(SessionId(1), 0);
        for n in 1..=10 {
            log.append(entry(n));
        }
        assert_eq!(log.len(), 4);

        let gap = log.read_from(1).err().unwrap();
        assert_eq!(
            gap,
            LogGap {
                segment: 2,
                requested: 1,
                first_available: 7
            }
        );
    }

    #[test]
    fn test_unregister_releases_records() {
        let mut log = ModificationLog::new(0, 0, 1000);
        log.register(SessionId(1), 0);
        for n in 1..=5 {
            log.append(entry(n));
        }
        assert_eq!(log.len(), 5);

        log.unregister(SessionId(1));
        assert_eq!(log.len(), 0);
        assert_eq!(log.first_seq(), 6);
        assert!(log.can_resume_from(5));
        assert!(!log.can_resume_from(4));
    }

    #[test]
    fn test_can_resume_from_rejects_future_cursor() {
        let mut log = ModificationLog::new(0, 10, 100);
        log.append(entry(1));
        assert!(log.can_resume_from(0));
        assert!(log.can_resume_from(1));
        assert!(!log.can_resume_from(2));
    }
}
