use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One remote node this node dials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// `host:port`
    pub endpoint: String,
    /// Expected node id, if known up front
    #[serde(default)]
    pub node_id: Option<u8>,
    /// Re-dial after a dropped connection
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_auto_reconnect() -> bool {
    true
}

impl PeerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        PeerConfig {
            endpoint: endpoint.into(),
            node_id: None,
            auto_reconnect: true,
        }
    }

    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node's origin id, unique across the cluster
    pub node_id: u8,
    /// Listen address for inbound peers. None accepts no connections.
    pub listen: Option<String>,
    pub peers: Vec<PeerConfig>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Log records read per segment per writer pass
    pub batch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            node_id: 1,
            listen: None,
            peers: Vec::new(),
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 3000,
            handshake_timeout_ms: 3000,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 5000,
            shutdown_timeout_ms: 2000,
            batch_size: 256,
        }
    }
}

impl ReplicationConfig {
    pub fn new(node_id: u8) -> Self {
        ReplicationConfig {
            node_id,
            ..Default::default()
        }
    }

    /// Short timeouts for tests on loopback
    pub fn fast(node_id: u8) -> Self {
        ReplicationConfig {
            node_id,
            listen: Some("127.0.0.1:0".to_string()),
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 1000,
            handshake_timeout_ms: 1000,
            reconnect_initial_ms: 20,
            reconnect_max_ms: 200,
            shutdown_timeout_ms: 1000,
            ..Default::default()
        }
    }

    pub fn with_listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    pub fn with_peer(mut self, endpoint: impl Into<String>) -> Self {
        self.peers.push(PeerConfig::new(endpoint));
        self
    }

    pub fn with_peer_config(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(listen) = &self.listen {
            validate_endpoint(listen)?;
        }

        let mut endpoints = HashSet::new();
        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            validate_endpoint(&peer.endpoint)?;
            if !endpoints.insert(peer.endpoint.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.endpoint.clone()));
            }
            if let Some(id) = peer.node_id {
                if id == self.node_id || !peer_ids.insert(id) {
                    return Err(ConfigError::IdentityCollision(id));
                }
            }
        }

        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms <= self.heartbeat_interval_ms
        {
            return Err(ConfigError::InvalidTiming(format!(
                "heartbeat timeout {}ms must exceed interval {}ms",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(ConfigError::InvalidTiming(format!(
                "reconnect backoff {}ms..{}ms",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidTiming("batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Accept `host:port` with a non-empty host and numeric port
fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let bad = || ConfigError::BadEndpoint(endpoint.to_string());
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(bad());
    }
    Ok(())
}
