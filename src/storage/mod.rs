//! Segmented Storage
//!
//! Fixed-capacity, pre-allocated node-local storage:
//!
//! - `entry`: entry model and its binary arena layout
//! - `arena`: chunked byte region with a free bitmap
//! - `index`: open-addressed hash index with deletion markers
//! - `modlog`: per-segment modification log drained by peer sessions
//! - `segment`: one lockable unit combining the three above
//! - `table`: the segment array, hashing, clock and change notification

pub mod arena;
pub mod entry;
pub mod index;
pub mod modlog;
pub mod segment;
pub mod table;

pub use entry::{Entry, OriginId, Version};
pub use modlog::{LogGap, LogRecord, SessionId};
pub use segment::{SegmentLayout, SegmentSnapshot, StoreError};
pub use table::SegmentTable;
