//! Peer Connection Lifecycle
//!
//! Drives one TCP connection from handshake to teardown:
//!
//! ```text
//! outbound:  send HELLO ─▶ read HELLO ─▶ claim ─┐
//! inbound:   read HELLO ─▶ send HELLO ─▶ claim ─┤
//!                                               ▼
//!                         ┌──── select ─────────────────────┐
//!                         │ reader: frames ─▶ Receiver      │
//!                         │ writer: Streamer + acks + beats │
//!                         │ claim token / shutdown          │
//!                         └─────────────────────────────────┘
//!                                               ▼
//!                       unregister session from logs, release claim
//! ```
//!
//! The inbound side replies before validating or claiming, so the dialing
//! side always learns who it reached: a self-connection is refused by both
//! ends, and a connector whose link lost deduplication knows which peer's
//! session to wait on.
//!
//! Reader and writer are polled by the same task; neither can block the
//! other, and both stop as soon as either fails.

use super::frame::{Frame, FrameCodec, Hello, PROTOCOL_VERSION};
use super::peer::{PeerDirectory, StatusBoard};
use super::receiver::Receiver;
use super::registry::{Direction, SessionRegistry};
use super::session::{SessionError, SessionLink, SessionState};
use super::streamer::Streamer;
use crate::replication::config::ReplicationConfig;
use crate::storage::{OriginId, SegmentTable, SessionId};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a session needs from its map instance
pub struct SessionContext {
    pub table: Arc<SegmentTable>,
    pub config: ReplicationConfig,
    /// Local session name
    pub name: String,
    /// This incarnation's random epoch
    pub epoch: u64,
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<PeerDirectory>,
    pub status: StatusBoard,
    next_session: AtomicU64,
}

impl SessionContext {
    pub fn new(
        table: Arc<SegmentTable>,
        config: ReplicationConfig,
        name: String,
        epoch: u64,
    ) -> Self {
        let origin = table.origin();
        SessionContext {
            table,
            config,
            name,
            epoch,
            registry: Arc::new(SessionRegistry::new(origin)),
            directory: Arc::new(PeerDirectory::new()),
            status: StatusBoard::new(),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.table.origin()
    }

    fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Our HELLO, offering resume cursors for `peer` when we hold them
    pub fn hello_for(&self, peer: Option<OriginId>) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            origin: self.origin(),
            epoch: self.epoch,
            segments: self.table.segment_count() as u32,
            name: self.name.clone(),
            resume: peer.and_then(|p| self.directory.resume_for(p)),
        }
    }

    /// Check a peer's HELLO before anything else is done with the connection
    pub fn validate_hello(
        &self,
        hello: &Hello,
        expected: Option<OriginId>,
    ) -> Result<(), SessionError> {
        if hello.version != PROTOCOL_VERSION {
            return Err(SessionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: hello.version,
            });
        }
        if hello.origin == self.origin() {
            return Err(SessionError::SelfConnection);
        }
        if let Some(expected) = expected {
            if expected != hello.origin {
                return Err(SessionError::UnexpectedPeer {
                    expected: expected.0,
                    actual: hello.origin.0,
                });
            }
        }
        if hello.segments == 0 {
            return Err(SessionError::Protocol("peer has no segments".to_string()));
        }
        Ok(())
    }
}

/// How a connection ended
#[derive(Debug)]
pub struct SessionOutcome {
    /// Peer identity, once its HELLO was read
    pub peer: Option<OriginId>,
    /// The connection won deduplication and ran as the session
    pub established: bool,
    pub error: SessionError,
}

/// Run one connection to completion.
///
/// `expected` is the peer id an outbound connector requires (or learned
/// from an earlier connection); `status_key` names the `StatusBoard` row.
pub async fn run_connection(
    ctx: &SessionContext,
    stream: TcpStream,
    direction: Direction,
    expected: Option<OriginId>,
    status_key: &str,
    shutdown: &CancellationToken,
) -> SessionOutcome {
    // Small frames (acks, heartbeats) must not wait for Nagle
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    run_framed(
        ctx,
        FramedRead::new(read_half, FrameCodec),
        FramedWrite::new(write_half, FrameCodec),
        direction,
        expected,
        status_key,
        shutdown,
    )
    .await
}

async fn run_framed<R, W>(
    ctx: &SessionContext,
    mut reader: FramedRead<R, FrameCodec>,
    mut writer: FramedWrite<W, FrameCodec>,
    direction: Direction,
    expected: Option<OriginId>,
    status_key: &str,
    shutdown: &CancellationToken,
) -> SessionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let conn_id = ctx.next_session_id();
    let handshake_timeout = ctx.config.handshake_timeout();

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------
    if direction == Direction::Outbound {
        let hello = ctx.hello_for(expected);
        if let Err(e) = writer.send(Frame::Hello(hello)).await {
            return outcome(None, false, e.into());
        }
    }

    let peer_hello = tokio::select! {
        result = timeout(handshake_timeout, read_hello(&mut reader)) => match result {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => return outcome(None, false, e),
            Err(_) => return outcome(None, false, SessionError::HandshakeTimeout),
        },
        _ = shutdown.cancelled() => return outcome(None, false, SessionError::Cancelled),
    };
    let peer = peer_hello.origin;

    if direction == Direction::Inbound {
        let hello = ctx.hello_for(Some(peer));
        if let Err(e) = writer.send(Frame::Hello(hello)).await {
            return outcome(Some(peer), false, e.into());
        }
    }

    if let Err(e) = ctx.validate_hello(&peer_hello, expected) {
        return outcome(Some(peer), false, e);
    }
    ctx.directory.observe_hello(&peer_hello);

    let claim = match ctx.registry.claim(peer, direction, conn_id.0, shutdown) {
        Ok(claim) => claim,
        Err(e) => return outcome(Some(peer), false, e),
    };

    info!(
        peer = %peer,
        peer_name = %peer_hello.name,
        ?direction,
        session = conn_id.0,
        "Peer session established"
    );

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------
    let link = SessionLink::new();
    let mut streamer = Streamer::new(
        ctx.table.clone(),
        conn_id,
        ctx.epoch,
        &peer_hello,
        ctx.config.batch_size,
    );
    if !streamer.is_bootstrapping() {
        link.mark_streaming();
    }
    let mut receiver = Receiver::new(
        ctx.table.clone(),
        ctx.directory.clone(),
        conn_id,
        &peer_hello,
    );
    ctx.status.update(status_key, |status| {
        status.peer = Some(peer);
        status.peer_name = Some(peer_hello.name.clone());
        status.state = link.state();
        status.last_error = None;
    });

    let error = tokio::select! {
        e = read_loop(ctx, &mut reader, &mut receiver, &link, status_key) => e,
        e = write_loop(ctx, &mut writer, &mut streamer, &link) => e,
        _ = claim.token().cancelled() => {
            if shutdown.is_cancelled() {
                SessionError::Cancelled
            } else {
                SessionError::Superseded
            }
        }
    };

    ctx.table.unregister(conn_id);
    debug!(peer = %peer, stats = ?receiver.stats(), "Peer session ended");
    drop(claim);
    outcome(Some(peer), true, error)
}

fn outcome(peer: Option<OriginId>, established: bool, error: SessionError) -> SessionOutcome {
    SessionOutcome {
        peer,
        established,
        error,
    }
}

async fn read_hello<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<Hello, SessionError>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(Ok(Frame::Hello(hello))) => Ok(hello),
        Some(Ok(other)) => Err(SessionError::Protocol(format!(
            "expected HELLO, got {}",
            other.name()
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(closed_by_peer()),
    }
}

fn closed_by_peer() -> SessionError {
    SessionError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    ))
}

/// Read frames until error; a silent peer times out
async fn read_loop<R>(
    ctx: &SessionContext,
    reader: &mut FramedRead<R, FrameCodec>,
    receiver: &mut Receiver,
    link: &SessionLink,
    status_key: &str,
) -> SessionError
where
    R: AsyncRead + Unpin,
{
    let heartbeat_timeout = ctx.config.heartbeat_timeout();
    loop {
        let frame = match timeout(heartbeat_timeout, reader.next()).await {
            Err(_) => return SessionError::HeartbeatTimeout,
            Ok(None) => return closed_by_peer(),
            Ok(Some(Err(e))) => return e.into(),
            Ok(Some(Ok(frame))) => frame,
        };
        match receiver.handle(frame, link) {
            Ok(true) => ctx.status.set_state(status_key, SessionState::Streaming),
            Ok(false) => {}
            Err(e) => return e,
        }
    }
}

/// Ship log records, snapshots, acks and heartbeats until error
async fn write_loop<W>(
    ctx: &SessionContext,
    writer: &mut FramedWrite<W, FrameCodec>,
    streamer: &mut Streamer,
    link: &SessionLink,
) -> SessionError
where
    W: AsyncWrite + Unpin,
{
    let mut changes = ctx.table.subscribe();
    let heartbeat_interval = ctx.config.heartbeat_interval();

    loop {
        // Mark the current change generation seen before draining, so any
        // write after this point wakes the idle wait below
        changes.borrow_and_update();

        let frames = match streamer.next_batch() {
            Ok(frames) => frames,
            Err(e) => return e,
        };
        let acks = link.take_acks();

        if frames.is_empty() && acks.is_none() {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return SessionError::Cancelled;
                    }
                }
                _ = link.notified() => {}
                _ = sleep(heartbeat_interval) => {
                    let beat = Frame::Heartbeat { sent_at_ms: ctx.table.clock().now_ms() };
                    if let Err(e) = writer.send(beat).await {
                        return e.into();
                    }
                }
            }
            continue;
        }

        if let Some(acks) = acks {
            if let Err(e) = writer.feed(Frame::Ack { acks }).await {
                return e.into();
            }
        }
        for frame in frames {
            if let Frame::SnapshotDone { cursors } = &frame {
                link.expect_bootstrap_acks(cursors);
            }
            if let Err(e) = writer.feed(frame).await {
                return e.into();
            }
        }
        if let Err(e) = writer.flush().await {
            return e.into();
        }
    }
}

/// Log a finished connection at a level matching its cause
pub fn log_outcome(endpoint: &str, outcome: &SessionOutcome) {
    match &outcome.error {
        SessionError::Cancelled => debug!(endpoint, "Connection closed on shutdown"),
        SessionError::Superseded => debug!(endpoint, "Connection superseded"),
        e if e.is_fatal_for_endpoint() => {
            tracing::error!(endpoint, error = %e, "Refusing peer")
        }
        e => warn!(endpoint, peer = ?outcome.peer, error = %e, "Peer connection lost"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HybridClock, SimulatedClock};
    use crate::replication::frame::FrameError;
    use crate::storage::{Entry, SegmentLayout, Version};
    use bytes::{Bytes, BytesMut};
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    fn context(origin: u8, epoch: u64) -> SessionContext {
        let clock = Arc::new(HybridClock::new(Arc::new(SimulatedClock::new(1_000))));
        let table = Arc::new(SegmentTable::new(
            OriginId(origin),
            clock,
            2,
            SegmentLayout {
                max_entries: 128,
                chunk_count: 512,
                chunk_size: 64,
                retain_records: 256,
                max_records: 1024,
            },
        ));
        SessionContext::new(table, ReplicationConfig::fast(origin), format!("node-{}", origin), epoch)
    }

    #[test]
    fn test_validate_hello() {
        let ctx = context(1, 10);
        let good = ctx.hello_for(None);
        let mut peer = good.clone();
        peer.origin = OriginId(2);
        assert!(ctx.validate_hello(&peer, None).is_ok());
        assert!(ctx.validate_hello(&peer, Some(OriginId(2))).is_ok());

        assert!(matches!(
            ctx.validate_hello(&good, None),
            Err(SessionError::SelfConnection)
        ));
        assert!(matches!(
            ctx.validate_hello(&peer, Some(OriginId(3))),
            Err(SessionError::UnexpectedPeer {
                expected: 3,
                actual: 2
            })
        ));

        let mut old = peer.clone();
        old.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            ctx.validate_hello(&old, None),
            Err(SessionError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_sessions_over_duplex_stream_converge() {
        let a = context(1, 10);
        let b = context(2, 20);
        a.table.put(Bytes::from_static(b"from-a"), Bytes::from_static(b"1")).unwrap();
        b.table.put(Bytes::from_static(b"from-b"), Bytes::from_static(b"2")).unwrap();

        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a_io);
        let (b_read, b_write) = tokio::io::split(b_io);
        let shutdown = CancellationToken::new();

        let session_a = run_framed(
            &a,
            FramedRead::new(a_read, FrameCodec),
            FramedWrite::new(a_write, FrameCodec),
            Direction::Outbound,
            None,
            "b",
            &shutdown,
        );
        let session_b = run_framed(
            &b,
            FramedRead::new(b_read, FrameCodec),
            FramedWrite::new(b_write, FrameCodec),
            Direction::Inbound,
            None,
            "a",
            &shutdown,
        );

        let check = async {
            for _ in 0..200 {
                if a.table.len() == 2 && b.table.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            shutdown.cancel();
        };

        let (outcome_a, outcome_b, _) = tokio::join!(session_a, session_b, check);
        assert!(outcome_a.established);
        assert!(outcome_b.established);
        assert_eq!(outcome_a.peer, Some(OriginId(2)));
        assert!(matches!(outcome_a.error, SessionError::Cancelled));

        assert_eq!(a.table.get(b"from-b").unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(b.table.get(b"from-a").unwrap(), Some(Bytes::from_static(b"1")));
        assert!(a.directory.resume_for(OriginId(2)).is_some());
        assert!(!a.registry.is_active(OriginId(2)), "Claim released at teardown");
    }

    #[tokio::test]
    async fn test_self_connection_is_refused() {
        let a = context(1, 10);
        let (a_io, b_io) = tokio::io::duplex(4096);
        let (a_read, a_write) = tokio::io::split(a_io);
        let (b_read, b_write) = tokio::io::split(b_io);
        let shutdown = CancellationToken::new();

        // Both ends run as node 1
        let (one, two) = tokio::join!(
            run_framed(
                &a,
                FramedRead::new(a_read, FrameCodec),
                FramedWrite::new(a_write, FrameCodec),
                Direction::Outbound,
                None,
                "x",
                &shutdown,
            ),
            run_framed(
                &a,
                FramedRead::new(b_read, FrameCodec),
                FramedWrite::new(b_write, FrameCodec),
                Direction::Inbound,
                None,
                "y",
                &shutdown,
            ),
        );
        assert!(matches!(one.error, SessionError::SelfConnection));
        assert!(matches!(two.error, SessionError::SelfConnection));
        assert!(!one.established);
        assert!(!two.established);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let a = context(1, 10);
        let hello = context(2, 20).hello_for(None);
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a_io);
        let (b_read, b_write) = tokio::io::split(b_io);
        let shutdown = CancellationToken::new();

        // Node 2 completes the handshake, then never sends another frame
        let silent_peer = async move {
            let mut writer = FramedWrite::new(b_write, FrameCodec);
            writer.send(Frame::Hello(hello)).await.unwrap();
            (b_read, writer)
        };

        let started = Instant::now();
        let (outcome, _peer_io) = tokio::join!(
            run_framed(
                &a,
                FramedRead::new(a_read, FrameCodec),
                FramedWrite::new(a_write, FrameCodec),
                Direction::Outbound,
                None,
                "silent",
                &shutdown,
            ),
            silent_peer,
        );

        assert!(outcome.established);
        assert!(matches!(outcome.error, SessionError::HeartbeatTimeout));
        assert!(started.elapsed() >= a.config.heartbeat_timeout());
        assert!(!a.registry.is_active(OriginId(2)));
    }

    #[tokio::test]
    async fn test_corrupt_frame_ends_session_without_applying() {
        let a = context(1, 10);
        let hello = context(2, 20).hello_for(None);

        let delta = |key: &'static [u8], seq: u64| Frame::Delta {
            segment: 0,
            seq,
            entry: Entry::live(
                Bytes::from_static(key),
                Bytes::from_static(b"v"),
                Version::new(5_000 + seq, OriginId(2)),
            ),
        };
        let mut bytes = BytesMut::new();
        FrameCodec.encode(Frame::Hello(hello), &mut bytes).unwrap();
        FrameCodec.encode(delta(b"intact", 1), &mut bytes).unwrap();
        FrameCodec.encode(delta(b"corrupt", 2), &mut bytes).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a_io);
        let (b_read, mut b_write) = tokio::io::split(b_io);
        let shutdown = CancellationToken::new();

        let peer = async move {
            b_write.write_all(&bytes).await.unwrap();
            (b_read, b_write)
        };

        let (outcome, _peer_io) = tokio::join!(
            run_framed(
                &a,
                FramedRead::new(a_read, FrameCodec),
                FramedWrite::new(a_write, FrameCodec),
                Direction::Outbound,
                None,
                "corrupt",
                &shutdown,
            ),
            peer,
        );

        assert!(outcome.established);
        assert!(matches!(
            outcome.error,
            SessionError::Frame(FrameError::ChecksumMismatch { .. })
        ));
        assert_eq!(a.table.get(b"intact").unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(a.table.get(b"corrupt").unwrap(), None);
        assert!(!a.registry.is_active(OriginId(2)));
    }
}
