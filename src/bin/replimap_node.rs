//! Replicated Map Node
//!
//! Runs one replicated map instance from a TOML config file and keeps it
//! connected to its peers until Ctrl-C.
//!
//! ```text
//! replimap-node node1.toml
//! REPLIMAP_CONFIG=node1.toml replimap-node
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | REPLIMAP_CONFIG | - | Config path when no argument is given |
//! | REPLIMAP_STATUS_SECS | 10 | Interval between peer status lines |
//! | REPLIMAP_LOG_JSON | unset | Emit logs as JSON when set |
//! | RUST_LOG | info | tracing env filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use replimap::{MapConfig, ReplicatedMap};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_STATUS_SECS: u64 = 10;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var_os("REPLIMAP_LOG_JSON").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("REPLIMAP_CONFIG").ok())
        .ok_or("usage: replimap-node <config.toml> (or set REPLIMAP_CONFIG)")?;

    let config = match MapConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path, error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let status_every = std::env::var("REPLIMAP_STATUS_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_STATUS_SECS);

    let map = ReplicatedMap::start(config).await?;
    info!(
        name = %map.name(),
        node = map.node_id(),
        listen = ?map.local_addr(),
        "Node running, Ctrl-C to stop"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match serde_json::to_string(&map.peer_status()) {
                    Ok(json) => info!(entries = map.len(), peers = %json, "Status"),
                    Err(e) => error!(error = %e, "Could not serialize peer status"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Signal handler failed");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    map.close().await;
    Ok(())
}
