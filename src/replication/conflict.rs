//! Last-Writer-Wins Conflict Resolution
//!
//! Every incoming entry (snapshot or delta) is checked against the version
//! the node currently holds for that key. The rule is a pure function of
//! the two versions:
//!
//! ```text
//! apply  iff  (incoming.timestamp, incoming.origin) > (local.timestamp, local.origin)
//!        or   no local entry exists
//! ```
//!
//! Because the comparison is a strict total order, re-delivering a record
//! is a no-op and any two records converge to the same winner in either
//! order.

use crate::storage::Version;

/// Outcome of comparing an incoming entry with local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming entry wins and must be stored and re-logged
    Apply,
    /// Local entry is newer or identical; drop the incoming one
    Discard,
}

impl Resolution {
    pub fn is_apply(self) -> bool {
        matches!(self, Resolution::Apply)
    }
}

/// Decide whether `incoming` supersedes the `local` version
#[inline]
pub fn resolve(local: Option<Version>, incoming: Version) -> Resolution {
    match local {
        None => Resolution::Apply,
        Some(local) if incoming > local => Resolution::Apply,
        Some(_) => Resolution::Discard,
    }
}
