//! Replication Manager
//!
//! Owns every network task of one map instance:
//!
//! ```text
//!                  ┌────────────────────── root token ──────────────────────┐
//!                  │                                                        │
//!   listener ──▶ accept loop ──▶ inbound session per connection (JoinSet)   │
//!   peer[0]  ──▶ connector: dial ─▶ session ─▶ backoff ─▶ dial ...          │
//!   peer[n]  ──▶ connector                                                  │
//!                  └────────────────────────────────────────────────────────┘
//! ```
//!
//! A connector stays idle while the registry holds a session with its peer
//! (for example one the peer initiated) and dials again once that session
//! ends. Shutdown cancels the root token and waits up to the configured
//! timeout before aborting what is left.

use super::config::PeerConfig;
use super::connection::{log_outcome, run_connection, SessionContext};
use super::peer::{Backoff, PeerStatus};
use super::registry::Direction;
use super::session::{SessionError, SessionState};
use crate::storage::OriginId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ReplicationManager {
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    local_addr: Option<SocketAddr>,
}

impl ReplicationManager {
    /// Bind the listener (if configured) and start one connector per peer
    pub async fn start(ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let local_addr = match ctx.config.listen.as_deref() {
            Some(listen) => {
                let listener = TcpListener::bind(listen).await?;
                let addr = listener.local_addr()?;
                info!(
                    node = %ctx.origin(),
                    name = %ctx.name,
                    %addr,
                    "Replication listening"
                );
                tasks.spawn(accept_loop(ctx.clone(), listener, shutdown.clone()));
                Some(addr)
            }
            None => None,
        };

        for peer in ctx.config.peers.clone() {
            ctx.status
                .insert(PeerStatus::new(peer.endpoint.clone(), Direction::Outbound));
            tasks.spawn(connector(ctx.clone(), peer, shutdown.clone()));
        }

        Ok(ReplicationManager {
            ctx,
            shutdown,
            tasks,
            local_addr,
        })
    }

    /// Bound listen address, with the real port when configured as 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.ctx.status.snapshot()
    }

    /// Close every live session; connectors with auto-reconnect dial again
    pub fn drop_connections(&self) {
        info!(node = %self.ctx.origin(), "Dropping all peer connections");
        self.ctx.registry.drop_all();
    }

    /// Stop all network tasks. Returns false if some had to be aborted.
    pub async fn shutdown(&mut self) -> bool {
        self.shutdown.cancel();
        let deadline = self.ctx.config.shutdown_timeout();

        let joined = timeout(deadline, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!(error = %e, "Replication task panicked");
                    }
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                debug!(node = %self.ctx.origin(), "Replication stopped");
                true
            }
            Err(_) => {
                warn!(
                    node = %self.ctx.origin(),
                    remaining = self.tasks.len(),
                    "Replication tasks did not stop in time, aborting"
                );
                self.tasks.abort_all();
                false
            }
        }
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("node", &self.ctx.origin())
            .field("local_addr", &self.local_addr)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

// ============================================================================
// Inbound
// ============================================================================

async fn accept_loop(ctx: Arc<SessionContext>, listener: TcpListener, shutdown: CancellationToken) {
    let mut sessions = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
            // Reap finished sessions so the set does not grow
            Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "Inbound replication connection");
                sessions.spawn(inbound_session(ctx.clone(), stream, addr, shutdown.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::select! {
                    _ = sleep(ctx.config.reconnect_initial()) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
}

async fn inbound_session(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let key = format!("inbound:{}", addr);
    let mut status = PeerStatus::new(key.clone(), Direction::Inbound);
    status.state = SessionState::Connecting;
    ctx.status.insert(status);

    let outcome = run_connection(&ctx, stream, Direction::Inbound, None, &key, &shutdown).await;
    log_outcome(&key, &outcome);
    ctx.status.remove(&key);
}

// ============================================================================
// Outbound
// ============================================================================

async fn connector(ctx: Arc<SessionContext>, peer: PeerConfig, shutdown: CancellationToken) {
    let endpoint = peer.endpoint.clone();
    let mut known: Option<OriginId> = peer.node_id.map(OriginId);
    let mut backoff = Backoff::new(ctx.config.reconnect_initial(), ctx.config.reconnect_max());
    let mut generation = ctx.registry.subscribe();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // A session with this peer already exists, typically one it dialed
        if let Some(peer_id) = known {
            if ctx.registry.is_active(peer_id) {
                generation.borrow_and_update();
                if ctx.registry.is_active(peer_id) {
                    tokio::select! {
                        changed = generation.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            }
        }

        ctx.status.set_state(&endpoint, SessionState::Connecting);
        let dialed = tokio::select! {
            dialed = timeout(ctx.config.handshake_timeout(), TcpStream::connect(&endpoint)) => dialed,
            _ = shutdown.cancelled() => break,
        };

        let retry = match dialed {
            Ok(Ok(stream)) => {
                ctx.status.set_state(&endpoint, SessionState::Bootstrapping);
                let outcome =
                    run_connection(&ctx, stream, Direction::Outbound, known, &endpoint, &shutdown)
                        .await;
                log_outcome(&endpoint, &outcome);
                if known.is_none() {
                    known = outcome.peer;
                }
                if outcome.established {
                    backoff.reset();
                }
                let message = outcome.error.to_string();
                ctx.status.update(&endpoint, |status| {
                    status.state = SessionState::Disconnected;
                    status.last_error = Some(message);
                });

                match outcome.error {
                    SessionError::Cancelled => break,
                    e if e.is_fatal_for_endpoint() => break,
                    // The peer's own connection won; the registry wait above
                    // holds us until it ends
                    SessionError::Superseded if !outcome.established => false,
                    _ => true,
                }
            }
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "Dial failed");
                record_error(&ctx, &endpoint, e.to_string());
                true
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "Dial timed out");
                record_error(&ctx, &endpoint, "connect timed out".to_string());
                true
            }
        };

        if !peer.auto_reconnect {
            info!(endpoint = %endpoint, "Connection ended, auto-reconnect disabled");
            break;
        }

        if retry {
            let delay = backoff.next_delay();
            let attempts = backoff.attempts();
            ctx.status
                .update(&endpoint, |status| status.reconnect_attempts = attempts);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
    }

    ctx.status.set_state(&endpoint, SessionState::Disconnected);
}

fn record_error(ctx: &SessionContext, endpoint: &str, message: String) {
    ctx.status.update(endpoint, |status| {
        status.state = SessionState::Disconnected;
        status.last_error = Some(message);
    });
}
