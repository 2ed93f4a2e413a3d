//! Replicated Map
//!
//! Public entry point: one `ReplicatedMap` is one node's view of a map
//! shared by every peer configured with the same name.
//!
//! ```text
//! caller ── get/put/remove ──▶ SegmentTable ◀── apply_remote ── sessions
//!                                   │                              ▲
//!                                   └─ change watch ─▶ streamers ──┘
//! ```
//!
//! Local operations are synchronous and visible immediately; replication
//! runs on the tokio runtime that called `start`. `close()` is idempotent
//! and bounded by `shutdown_timeout_ms`.

use crate::clock::{Clock, HybridClock, SystemClock};
use crate::codec::{BincodeCodec, Codec, CodecError};
use crate::config::{ConfigError, MapConfig};
use crate::replication::{PeerStatus, ReplicationManager, SessionContext};
use crate::storage::{OriginId, SegmentTable, StoreError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Smallest interval between tombstone purge passes
const MIN_PURGE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum MapError {
    Store(StoreError),
    Config(ConfigError),
    Codec(CodecError),
    Io(std::io::Error),
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::Store(e) => write!(f, "{}", e),
            MapError::Config(e) => write!(f, "{}", e),
            MapError::Codec(e) => write!(f, "{}", e),
            MapError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapError::Store(e) => Some(e),
            MapError::Config(e) => Some(e),
            MapError::Codec(e) => Some(e),
            MapError::Io(e) => Some(e),
        }
    }
}

impl From<StoreError> for MapError {
    fn from(e: StoreError) -> Self {
        MapError::Store(e)
    }
}

impl From<ConfigError> for MapError {
    fn from(e: ConfigError) -> Self {
        MapError::Config(e)
    }
}

impl From<CodecError> for MapError {
    fn from(e: CodecError) -> Self {
        MapError::Codec(e)
    }
}

impl From<std::io::Error> for MapError {
    fn from(e: std::io::Error) -> Self {
        MapError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, MapError>;

// ============================================================================
// ReplicatedMap
// ============================================================================

pub struct ReplicatedMap {
    config: MapConfig,
    table: Arc<SegmentTable>,
    epoch: u64,
    local_addr: Option<SocketAddr>,
    manager: tokio::sync::Mutex<ReplicationManager>,
    context: Arc<SessionContext>,
    maintenance: CancellationToken,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedMap {
    /// Validate `config`, allocate the table and start replication
    pub async fn start(config: MapConfig) -> Result<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock::new())).await
    }

    pub async fn start_with_clock(config: MapConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let origin = OriginId(config.replication.node_id);
        let table = Arc::new(SegmentTable::new(
            origin,
            Arc::new(HybridClock::new(clock)),
            config.segments,
            config.segment_layout(),
        ));
        let epoch = rand::random::<u64>();
        let context = Arc::new(SessionContext::new(
            table.clone(),
            config.replication.clone(),
            config.name.clone(),
            epoch,
        ));

        let manager = match ReplicationManager::start(context.clone()).await {
            Ok(manager) => manager,
            Err(e) => {
                table.release();
                return Err(e.into());
            }
        };
        let local_addr = manager.local_addr();

        let maintenance = CancellationToken::new();
        let purge_task = config
            .tombstone_ttl()
            .map(|ttl| tokio::spawn(purge_loop(table.clone(), ttl, maintenance.clone())));

        info!(
            name = %config.name,
            node = %origin,
            epoch,
            segments = config.segments,
            entries = config.entries,
            peers = config.replication.peers.len(),
            listen = ?local_addr,
            "Replicated map started"
        );

        Ok(ReplicatedMap {
            config,
            table,
            epoch,
            local_addr,
            manager: tokio::sync::Mutex::new(manager),
            context,
            maintenance,
            purge_task: Mutex::new(purge_task),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.table.get(key)?)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.table.contains_key(key)?)
    }

    /// Store a value, returning the previous one. Fails with
    /// `CapacityExceeded` when the key's segment is full.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        Ok(self.table.put(key.into(), value.into())?)
    }

    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.table.remove(key)?)
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Copy of every live entry. Each segment is read atomically, the whole
    /// map is not.
    pub fn entries(&self) -> Result<Vec<(Bytes, Bytes)>> {
        Ok(self.table.entries()?)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn node_id(&self) -> u8 {
        self.table.origin().0
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Bound replication listen address, if a listener is configured
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.context.status.snapshot()
    }

    /// Node ids with a live session
    pub fn connected_peers(&self) -> Vec<u8> {
        self.context
            .registry
            .active_peers()
            .into_iter()
            .map(|p| p.0)
            .collect()
    }

    /// Tear down every live session. Connectors with auto-reconnect dial
    /// again after backoff.
    pub fn drop_connections(&self) {
        self.context.registry.drop_all();
    }

    /// Drop tombstones older than the configured TTL now. Returns how many
    /// were purged; 0 without a TTL.
    pub fn purge_tombstones(&self) -> usize {
        match self.config.tombstone_ttl() {
            Some(ttl) => self.table.purge_tombstones(ttl),
            None => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.table.is_closed()
    }

    /// Stop replication and free storage. Later operations fail with
    /// `Closed`. Safe to call more than once.
    pub async fn close(&self) {
        let mut manager = self.manager.lock().await;
        if self.table.is_closed() {
            return;
        }

        self.maintenance.cancel();
        let purge_task = self.purge_task.lock().take();
        if let Some(task) = purge_task {
            task.abort();
        }

        let clean = manager.shutdown().await;
        self.table.release();
        info!(name = %self.config.name, node = %self.table.origin(), clean, "Replicated map closed");
    }
}

impl Drop for ReplicatedMap {
    fn drop(&mut self) {
        self.maintenance.cancel();
        if let Some(task) = self.purge_task.lock().take() {
            task.abort();
        }
        // Sessions see the closed table and stop; the manager's own drop
        // cancels the rest
        self.table.release();
    }
}

impl std::fmt::Debug for ReplicatedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedMap")
            .field("name", &self.config.name)
            .field("node", &self.table.origin())
            .field("epoch", &self.epoch)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.table.is_closed())
            .finish()
    }
}

async fn purge_loop(table: Arc<SegmentTable>, ttl: Duration, cancel: CancellationToken) {
    let period = (ttl / 2).max(MIN_PURGE_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if table.is_closed() {
                    break;
                }
                let purged = table.purge_tombstones(ttl);
                if purged > 0 {
                    debug!(purged, "Purged expired tombstones");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

// ============================================================================
// TypedMap
// ============================================================================

/// Typed view over a `ReplicatedMap`. Every node sharing the map must use
/// the same codecs.
pub struct TypedMap<K, V, KC = BincodeCodec, VC = BincodeCodec> {
    map: ReplicatedMap,
    key_codec: KC,
    value_codec: VC,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KC, VC> TypedMap<K, V, KC, VC>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    pub fn new(map: ReplicatedMap) -> Self
    where
        KC: Default,
        VC: Default,
    {
        Self::with_codecs(map, KC::default(), VC::default())
    }

    pub fn with_codecs(map: ReplicatedMap, key_codec: KC, value_codec: VC) -> Self {
        TypedMap {
            map,
            key_codec,
            value_codec,
            _types: PhantomData,
        }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = self.key_codec.encode(key)?;
        self.decode_value(self.map.get(&key)?)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let key = self.key_codec.encode(key)?;
        self.map.contains_key(&key)
    }

    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let key = self.key_codec.encode(key)?;
        let value = self.value_codec.encode(value)?;
        self.decode_value(self.map.put(key, value)?)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let key = self.key_codec.encode(key)?;
        self.decode_value(self.map.remove(&key)?)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.map
            .entries()?
            .into_iter()
            .map(|(k, v)| Ok((self.key_codec.decode(&k)?, self.value_codec.decode(&v)?)))
            .collect()
    }

    /// The untyped map, for status and lifecycle calls
    pub fn inner(&self) -> &ReplicatedMap {
        &self.map
    }

    pub fn into_inner(self) -> ReplicatedMap {
        self.map
    }

    fn decode_value(&self, bytes: Option<Bytes>) -> Result<Option<V>> {
        match bytes {
            Some(bytes) => Ok(Some(self.value_codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
