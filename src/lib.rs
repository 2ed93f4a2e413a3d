//! replimap: a replicated, segmented key-value map
//!
//! Every node holds the whole map in a fixed-capacity segmented table and
//! streams its mutations to peers over TCP. Concurrent writes resolve by
//! last-writer-wins on `(timestamp, origin)`, so all nodes converge once
//! writes stop.

pub mod clock;
pub mod codec;
pub mod config;
pub mod map;
pub mod replication;
pub mod storage;

pub use clock::{Clock, HybridClock, SimulatedClock, SystemClock};
pub use codec::{BincodeCodec, BytesCodec, Codec, CodecError, Utf8Codec};
pub use config::{ConfigError, LogConfig, MapConfig};
pub use map::{MapError, ReplicatedMap, TypedMap};
pub use replication::{Direction, PeerConfig, PeerStatus, ReplicationConfig, SessionState};
pub use storage::{Entry, OriginId, StoreError, Version};
