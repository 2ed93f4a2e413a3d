//! Session Registry
//!
//! Guarantees at most one live session per remote node. When two nodes dial
//! each other at the same time both connections complete a handshake; each
//! node then applies the same rule independently, so both keep the same
//! connection:
//!
//! ```text
//! existing \ new      same direction      other direction
//! ──────────────────────────────────────────────────────────────
//! none                accept              accept
//! some                replace existing    keep whichever was initiated by
//!                                         min(local, peer); cancel the other
//! ```
//!
//! A claim is released when its `SessionClaim` guard drops. Connectors watch
//! the registry generation to learn when a peer's session ends.

use super::session::SessionError;
use crate::storage::OriginId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We dialed the peer
    Outbound,
    /// The peer dialed us
    Inbound,
}

#[derive(Debug)]
struct ActiveSession {
    conn_id: u64,
    direction: Direction,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct SessionRegistry {
    local: OriginId,
    active: Mutex<HashMap<OriginId, ActiveSession>>,
    generation: watch::Sender<u64>,
}

impl SessionRegistry {
    pub fn new(local: OriginId) -> Self {
        let (generation, _) = watch::channel(0);
        SessionRegistry {
            local,
            active: Mutex::new(HashMap::new()),
            generation,
        }
    }

    fn initiator(&self, peer: OriginId, direction: Direction) -> OriginId {
        match direction {
            Direction::Outbound => self.local,
            Direction::Inbound => peer,
        }
    }

    /// Register connection `conn_id` as the session with `peer`.
    /// `parent` is the token the session's own token derives from.
    pub fn claim(
        self: &Arc<Self>,
        peer: OriginId,
        direction: Direction,
        conn_id: u64,
        parent: &CancellationToken,
    ) -> Result<SessionClaim, SessionError> {
        debug_assert_ne!(peer, self.local, "Precondition: cannot claim a session with self");

        let cancel = parent.child_token();
        {
            let mut active = self.active.lock();
            if let Some(existing) = active.get(&peer) {
                let winner = self.local.min(peer);
                let keep_existing = existing.direction != direction
                    && self.initiator(peer, existing.direction) == winner;
                if keep_existing {
                    debug!(
                        peer = %peer,
                        ?direction,
                        existing = existing.conn_id,
                        "Rejecting duplicate connection"
                    );
                    return Err(SessionError::Superseded);
                }
                debug!(
                    peer = %peer,
                    ?direction,
                    replaced = existing.conn_id,
                    "Replacing existing connection"
                );
                existing.cancel.cancel();
            }
            active.insert(
                peer,
                ActiveSession {
                    conn_id,
                    direction,
                    cancel: cancel.clone(),
                },
            );
        }
        self.bump();

        Ok(SessionClaim {
            registry: self.clone(),
            peer,
            conn_id,
            cancel,
        })
    }

    pub fn is_active(&self, peer: OriginId) -> bool {
        self.active.lock().contains_key(&peer)
    }

    pub fn active_peers(&self) -> Vec<OriginId> {
        let mut peers: Vec<OriginId> = self.active.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Tear down every live session
    pub fn drop_all(&self) {
        for session in self.active.lock().values() {
            session.cancel.cancel();
        }
    }

    /// Generation counter bumped on every claim and release
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn release(&self, peer: OriginId, conn_id: u64) {
        let removed = {
            let mut active = self.active.lock();
            match active.get(&peer) {
                Some(session) if session.conn_id == conn_id => active.remove(&peer).is_some(),
                _ => false,
            }
        };
        if removed {
            self.bump();
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

/// Ownership of the session slot for one peer; released on drop
#[derive(Debug)]
pub struct SessionClaim {
    registry: Arc<SessionRegistry>,
    peer: OriginId,
    conn_id: u64,
    cancel: CancellationToken,
}

impl SessionClaim {
    pub fn peer(&self) -> OriginId {
        self.peer
    }

    /// Cancelled when this session is superseded, dropped or shut down
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.registry.release(self.peer, self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(local: u8) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(OriginId(local)))
    }

    #[test]
    fn test_claim_and_release() {
        let reg = registry(1);
        let root = CancellationToken::new();
        let claim = reg.claim(OriginId(2), Direction::Outbound, 1, &root).unwrap();
        assert!(reg.is_active(OriginId(2)));
        assert_eq!(claim.peer(), OriginId(2));

        drop(claim);
        assert!(!reg.is_active(OriginId(2)));
    }

    #[test]
    fn test_lower_id_initiated_connection_wins() {
        let root = CancellationToken::new();

        // Node 1: its outbound was initiated by 1, the inbound by 2
        let node1 = registry(1);
        let inbound = node1.claim(OriginId(2), Direction::Inbound, 1, &root).unwrap();
        let outbound = node1.claim(OriginId(2), Direction::Outbound, 2, &root).unwrap();
        assert!(inbound.token().is_cancelled(), "Inbound from 2 loses to outbound from 1");
        assert!(!outbound.token().is_cancelled());

        // Node 2 sees the same pair from the other side
        let node2 = registry(2);
        let inbound = node2.claim(OriginId(1), Direction::Inbound, 1, &root).unwrap();
        let rejected = node2.claim(OriginId(1), Direction::Outbound, 2, &root);
        assert!(matches!(rejected, Err(SessionError::Superseded)));
        assert!(!inbound.token().is_cancelled());
    }

    #[test]
    fn test_same_direction_newer_replaces_older() {
        let reg = registry(1);
        let root = CancellationToken::new();
        let old = reg.claim(OriginId(2), Direction::Outbound, 1, &root).unwrap();
        let new = reg.claim(OriginId(2), Direction::Outbound, 2, &root).unwrap();
        assert!(old.token().is_cancelled());

        // Releasing the replaced claim must not evict the new one
        drop(old);
        assert!(reg.is_active(OriginId(2)));
        drop(new);
        assert!(!reg.is_active(OriginId(2)));
    }

    #[test]
    fn test_drop_all_and_parent_cancellation() {
        let reg = registry(1);
        let root = CancellationToken::new();
        let a = reg.claim(OriginId(2), Direction::Outbound, 1, &root).unwrap();
        let b = reg.claim(OriginId(3), Direction::Inbound, 2, &root).unwrap();
        assert_eq!(reg.active_peers(), vec![OriginId(2), OriginId(3)]);

        reg.drop_all();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());

        let root = CancellationToken::new();
        let c = reg.claim(OriginId(4), Direction::Outbound, 3, &root).unwrap();
        root.cancel();
        assert!(c.token().is_cancelled());
    }

    #[test]
    fn test_generation_bumps_on_claim_and_release() {
        let reg = registry(1);
        let root = CancellationToken::new();
        let mut rx = reg.subscribe();

        let claim = reg.claim(OriginId(2), Direction::Outbound, 1, &root).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        drop(claim);
        assert!(rx.has_changed().unwrap());
    }
}
