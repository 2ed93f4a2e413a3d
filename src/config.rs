//! Map Configuration
//!
//! A map instance is described by one `MapConfig`, usually loaded from TOML:
//!
//! ```toml
//! name = "orders"
//! entries = 100000
//! segments = 16
//!
//! [log]
//! retain_records = 4096
//!
//! [replication]
//! node_id = 1
//! listen = "0.0.0.0:7001"
//!
//! [[replication.peers]]
//! endpoint = "10.0.0.2:7001"
//! node_id = 2
//! ```
//!
//! Every field has a default. `validate()` rejects configurations the
//! store cannot honor before anything is allocated or bound.

use crate::replication::config::ReplicationConfig;
use crate::replication::frame::MAX_NAME_LEN;
use crate::storage::entry::ENTRY_HEADER_SIZE;
use crate::storage::SegmentLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on segment count
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Configuration error, fatal at map construction
#[derive(Debug)]
pub enum ConfigError {
    InvalidCapacity(String),
    InvalidSegments(usize),
    BadEndpoint(String),
    DuplicatePeer(String),
    /// A peer is configured with our own node id, or two peers share one
    IdentityCollision(u8),
    InvalidTiming(String),
    /// Session name is empty or too long for HELLO
    InvalidName(String),
    Parse(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidCapacity(msg) => write!(f, "Invalid capacity: {}", msg),
            ConfigError::InvalidSegments(n) => {
                write!(f, "Invalid segment count {} (must be 1..={})", n, MAX_SEGMENTS)
            }
            ConfigError::BadEndpoint(endpoint) => write!(f, "Bad endpoint: {:?}", endpoint),
            ConfigError::DuplicatePeer(endpoint) => {
                write!(f, "Peer endpoint listed twice: {}", endpoint)
            }
            ConfigError::IdentityCollision(id) => write!(f, "Node id {} is not unique", id),
            ConfigError::InvalidTiming(msg) => write!(f, "Invalid timing: {}", msg),
            ConfigError::InvalidName(msg) => write!(f, "Invalid name: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Modification log retention, per segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Acknowledged records kept so a dropped peer can resume
    pub retain_records: usize,
    /// Hard cap; a peer pinning more than this must re-bootstrap
    pub max_records: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            retain_records: 4096,
            max_records: 65536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Session display name, sent in the handshake and used in logs
    pub name: String,
    /// Total entry capacity (live entries plus tombstones)
    pub entries: usize,
    pub segments: usize,
    /// Expected key + value size, used to size the arenas
    pub average_entry_size: usize,
    /// Arena allocation unit in bytes
    pub chunk_size: usize,
    pub log: LogConfig,
    /// Purge tombstones older than this. None keeps them forever.
    pub tombstone_ttl_ms: Option<u64>,
    pub replication: ReplicationConfig,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            name: "replimap".to_string(),
            entries: 1 << 16,
            segments: 16,
            average_entry_size: 128,
            chunk_size: 64,
            log: LogConfig::default(),
            tombstone_ttl_ms: None,
            replication: ReplicationConfig::default(),
        }
    }
}

impl MapConfig {
    pub fn new(name: impl Into<String>, node_id: u8) -> Self {
        MapConfig {
            name: name.into(),
            replication: ReplicationConfig::new(node_id),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: MapConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_entries(mut self, entries: usize) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_average_entry_size(mut self, bytes: usize) -> Self {
        self.average_entry_size = bytes;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    pub fn tombstone_ttl(&self) -> Option<Duration> {
        self.tombstone_ttl_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(ConfigError::InvalidName(format!(
                "name must be 1..={} bytes, got {}",
                MAX_NAME_LEN,
                self.name.len()
            )));
        }
        if self.entries == 0 {
            return Err(ConfigError::InvalidCapacity(
                "entries must be positive".to_string(),
            ));
        }
        if self.segments == 0 || self.segments > MAX_SEGMENTS {
            return Err(ConfigError::InvalidSegments(self.segments));
        }
        if self.chunk_size == 0 || self.average_entry_size == 0 {
            return Err(ConfigError::InvalidCapacity(
                "chunk_size and average_entry_size must be positive".to_string(),
            ));
        }
        if self.log.max_records == 0 || self.log.retain_records > self.log.max_records {
            return Err(ConfigError::InvalidCapacity(format!(
                "log retain_records {} must not exceed max_records {}",
                self.log.retain_records, self.log.max_records
            )));
        }
        let layout = self.segment_layout();
        if layout.chunk_count >= u32::MAX as usize {
            return Err(ConfigError::InvalidCapacity(format!(
                "{} chunks per segment exceeds the addressable range",
                layout.chunk_count
            )));
        }
        self.replication.validate()
    }

    /// Per-segment sizing derived from total capacity
    pub fn segment_layout(&self) -> SegmentLayout {
        let max_entries = self.entries.div_ceil(self.segments.max(1));
        let chunks_per_entry =
            (self.average_entry_size + ENTRY_HEADER_SIZE).div_ceil(self.chunk_size.max(1));
        SegmentLayout {
            max_entries,
            chunk_count: max_entries * chunks_per_entry,
            chunk_size: self.chunk_size,
            retain_records: self.log.retain_records,
            max_records: self.log.max_records,
        }
    }
}
