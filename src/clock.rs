//! Clock Abstraction
//!
//! Time sources for entry timestamps. Production nodes read the system
//! clock; simulation tests drive a `SimulatedClock` by hand.
//!
//! Entry timestamps are not raw wall-clock readings. Every node issues them
//! through a `HybridClock`, which never hands out the same value twice and
//! never goes below a timestamp it has already observed from a peer:
//!
//! ```text
//! issue()      = max(source.now_ms(), last + 1)
//! observe(ts)  : last = max(last, ts)
//! ```
//!
//! Issuing under the segment lock therefore guarantees a local write always
//! supersedes whatever the node currently holds for that key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Millisecond time source
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the UNIX epoch (or since an
    /// arbitrary origin for simulated clocks)
    fn now_ms(&self) -> u64;
}

/// Production clock using real system time
pub struct SystemClock {
    /// Epoch instant for calculating timestamps
    start: Instant,
    /// Initial timestamp in milliseconds
    start_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        // A clock set before 1970 degrades to a zero origin; the hybrid
        // clock keeps timestamps strictly increasing regardless.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.start_millis.saturating_add(elapsed)
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone)]
pub struct SimulatedClock {
    /// Current virtual time in milliseconds
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    /// Create a new simulated clock starting at the given time
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance time by the given duration
    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Advance time by milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set time to a specific value (may move backwards to model skew)
    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

/// Strictly increasing timestamp issuer layered over a `Clock`
pub struct HybridClock {
    source: Arc<dyn Clock>,
    last: AtomicU64,
}

impl HybridClock {
    pub fn new(source: Arc<dyn Clock>) -> Self {
        HybridClock {
            source,
            last: AtomicU64::new(0),
        }
    }

    /// Issue a timestamp greater than every timestamp issued or observed so far
    pub fn issue(&self) -> u64 {
        let now = self.source.now_ms();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_assert!(next > last, "Postcondition: issued timestamp must advance");
                    return next;
                }
                Err(actual) => last = actual,
            }
        }
    }

    /// Record a timestamp seen on a remote entry
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Current time without issuing: never below anything issued or observed
    pub fn now_ms(&self) -> u64 {
        self.source.now_ms().max(self.last())
    }

    /// Highest timestamp issued or observed
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.last())
            .finish()
    }
}
