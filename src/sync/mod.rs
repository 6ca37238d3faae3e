//! Synchronization primitives
//!
//! Non-reentrant spin locks used for the manager, per-cache metadata and
//! hash-table buckets. Critical sections under these locks are short
//! (microseconds), so spinning with bounded back-off beats parking.
//!
//! Back-off escalates from CPU pause hints to thread yields and finally to
//! short OS sleeps once the spin budget is exhausted.

mod spin;

pub use spin::{SpinGuard, SpinLock, SpinReadGuard, SpinRwLock, SpinWriteGuard};

/// Retry bound for opportunistic lock attempts on hot paths
pub const TRIES_FAST: usize = 200;

/// Retry bound for background requests (grow, migrate)
pub const TRIES_SLOW: usize = 10_000;
