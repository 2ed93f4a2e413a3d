//! TCP Replication
//!
//! Multi-master replication between map instances that share a name:
//!
//! - `frame`: wire format and `FrameCodec`
//! - `conflict`: last-writer-wins resolution with origin tie-break
//! - `streamer` / `receiver`: outbound and inbound halves of one session
//! - `session` / `registry` / `peer`: session state, deduplication, cursors
//! - `connection` / `manager`: sockets, handshake, reconnects, shutdown
//! - `convergence_dst`: seeded simulation of the pipeline without sockets

pub mod config;
pub mod conflict;
pub mod connection;
pub mod convergence_dst;
pub mod frame;
pub mod manager;
pub mod peer;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod streamer;

pub use config::{PeerConfig, ReplicationConfig};
pub use conflict::{resolve, Resolution};
pub use connection::SessionContext;
pub use convergence_dst::{
    run_convergence_batch, summarize_batch, ConvergenceConfig, ConvergenceHarness,
    ConvergenceResult, Topology,
};
pub use frame::{Frame, FrameCodec, FrameError, Hello, PROTOCOL_VERSION};
pub use manager::ReplicationManager;
pub use peer::PeerStatus;
pub use registry::Direction;
pub use session::{SessionError, SessionState};
