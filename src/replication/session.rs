//! Peer Session State
//!
//! A session is one established connection to one peer. Its reader and
//! writer run concurrently and share a `SessionLink`:
//!
//! ```text
//!   reader ── queue_ack(seg, seq) ──▶ SessionLink ──▶ take_acks() ── writer
//!   reader ── on_ack(seg, seq) ────▶ (bootstrap progress)
//! ```
//!
//! Acks are coalesced per segment (only the highest seq matters) and
//! piggybacked on the writer's next flush.

use super::frame::FrameError;
use crate::storage::LogGap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Per-peer replication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Bootstrapping,
    Streaming,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Bootstrapping => "BOOTSTRAPPING",
            SessionState::Streaming => "STREAMING",
        };
        f.write_str(name)
    }
}

/// Why a session ended. Never surfaced to map callers.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Frame(FrameError),
    HandshakeTimeout,
    HeartbeatTimeout,
    /// Peer announced our own node id
    SelfConnection,
    /// Peer announced a different node id than configured for the endpoint
    UnexpectedPeer { expected: u8, actual: u8 },
    VersionMismatch { ours: u16, theirs: u16 },
    /// A frame that is well-formed but not valid at this point
    Protocol(String),
    /// Another connection to the same peer won deduplication
    Superseded,
    Cancelled,
    Gap(LogGap),
}

impl SessionError {
    /// Errors after which the connector stops dialing the endpoint
    pub fn is_fatal_for_endpoint(&self) -> bool {
        matches!(
            self,
            SessionError::SelfConnection | SessionError::UnexpectedPeer { .. }
        )
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::Frame(e) => write!(f, "{}", e),
            SessionError::HandshakeTimeout => write!(f, "Handshake timed out"),
            SessionError::HeartbeatTimeout => write!(f, "No frame within heartbeat timeout"),
            SessionError::SelfConnection => write!(f, "Connected to self"),
            SessionError::UnexpectedPeer { expected, actual } => write!(
                f,
                "Endpoint is node {} but node {} was configured",
                actual, expected
            ),
            SessionError::VersionMismatch { ours, theirs } => write!(
                f,
                "Protocol version mismatch: ours {}, theirs {}",
                ours, theirs
            ),
            SessionError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            SessionError::Superseded => write!(f, "Superseded by another connection"),
            SessionError::Cancelled => write!(f, "Cancelled"),
            SessionError::Gap(gap) => write!(f, "{}", gap),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => SessionError::Io(e),
            other => SessionError::Frame(other),
        }
    }
}

impl From<LogGap> for SessionError {
    fn from(gap: LogGap) -> Self {
        SessionError::Gap(gap)
    }
}

/// State shared by a session's reader and writer
#[derive(Debug, Default)]
pub struct SessionLink {
    /// Highest seq received per peer segment, not yet acked
    acks: Mutex<BTreeMap<u32, u64>>,
    /// Segments whose snapshot cursor the peer has not acked yet
    bootstrap: Mutex<BTreeMap<u32, u64>>,
    streaming: AtomicBool,
    wake: Notify,
}

impl SessionLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that everything up to `seq` of peer segment `segment` was applied
    pub fn queue_ack(&self, segment: u32, seq: u64) {
        {
            let mut acks = self.acks.lock();
            let slot = acks.entry(segment).or_insert(seq);
            *slot = (*slot).max(seq);
        }
        self.wake.notify_one();
    }

    /// Drain coalesced acks
    pub fn take_acks(&self) -> Option<Vec<(u32, u64)>> {
        let mut acks = self.acks.lock();
        if acks.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *acks).into_iter().collect())
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.acks.lock().is_empty()
    }

    /// Wait until a reader queues an ack (or `wake` is called)
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// A snapshot ending at `cursors` was sent; streaming resumes once the
    /// peer acks every cursor
    pub fn expect_bootstrap_acks(&self, cursors: &[u64]) {
        let mut pending = self.bootstrap.lock();
        pending.clear();
        pending.extend(cursors.iter().enumerate().map(|(s, c)| (s as u32, *c)));
        self.streaming.store(pending.is_empty(), Ordering::Release);
    }

    /// Nothing to bootstrap: the peer resumed every segment
    pub fn mark_streaming(&self) {
        self.bootstrap.lock().clear();
        self.streaming.store(true, Ordering::Release);
    }

    /// Apply a peer ack of our segment `segment` up to `seq`.
    /// Returns true when this ack completed bootstrapping.
    pub fn on_ack(&self, segment: u32, seq: u64) -> bool {
        let mut pending = self.bootstrap.lock();
        if pending.is_empty() {
            return false;
        }
        if pending.get(&segment).is_some_and(|cursor| seq >= *cursor) {
            pending.remove(&segment);
        }
        if pending.is_empty() {
            self.streaming.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.is_streaming() {
            SessionState::Streaming
        } else {
            SessionState::Bootstrapping
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acks_coalesce_per_segment() {
        let link = SessionLink::new();
        link.queue_ack(2, 5);
        link.queue_ack(2, 9);
        link.queue_ack(2, 7);
        link.queue_ack(0, 1);

        assert_eq!(link.take_acks(), Some(vec![(0, 1), (2, 9)]));
        assert_eq!(link.take_acks(), None);
        assert!(!link.has_pending_acks());
    }

    #[test]
    fn test_bootstrap_completes_when_all_cursors_acked() {
        let link = SessionLink::new();
        assert_eq!(link.state(), SessionState::Bootstrapping);

        link.expect_bootstrap_acks(&[3, 0, 8]);
        assert!(!link.on_ack(0, 3));
        assert!(!link.on_ack(2, 7), "Ack below cursor does not count");
        assert!(!link.on_ack(1, 0));
        assert!(link.on_ack(2, 8));
        assert_eq!(link.state(), SessionState::Streaming);

        // Later acks are ordinary
        assert!(!link.on_ack(2, 20));
    }

    #[test]
    fn test_resumed_session_streams_immediately() {
        let link = SessionLink::new();
        link.mark_streaming();
        assert!(link.is_streaming());

        // A later re-snapshot goes back to bootstrapping
        link.expect_bootstrap_acks(&[4]);
        assert_eq!(link.state(), SessionState::Bootstrapping);
        assert!(link.on_ack(0, 4));
    }

    #[tokio::test]
    async fn test_queued_ack_wakes_writer() {
        let link = std::sync::Arc::new(SessionLink::new());
        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.notified().await })
        };
        link.queue_ack(0, 1);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SessionError::SelfConnection.is_fatal_for_endpoint());
        assert!(SessionError::UnexpectedPeer {
            expected: 2,
            actual: 3
        }
        .is_fatal_for_endpoint());
        assert!(!SessionError::HeartbeatTimeout.is_fatal_for_endpoint());
        assert!(!SessionError::Superseded.is_fatal_for_endpoint());
    }
}
