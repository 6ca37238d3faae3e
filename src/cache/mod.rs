//! In-Process Cache Manager
//!
//! A manager owns a global memory budget and shares it between many
//! independent hash-table caches. Caches ask for more memory when they are
//! full; the manager grants, refuses, or rebalances based on how often each
//! cache is accessed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Manager                                     │
//! │  budget (hard / soft / highwater)   table pool   access + find stats    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │   Cache 1 (plain)          │   Cache 2 (transactional)   │   Cache n ... │
//! │  ┌──────────────────────┐  │  ┌──────────────────────┐   │               │
//! │  │ Metadata (spin lock) │  │  │ Metadata (spin lock) │   │               │
//! │  │ Table 2^k buckets    │  │  │ Table 2^k buckets    │   │               │
//! │  │  └ auxiliary table   │  │  │  + blacklist terms   │   │               │
//! │  └──────────────────────┘  │  └──────────────────────┘   │               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │          Executor: FreeMemoryTask / MigrateTask (caller supplied)        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lock Order
//!
//! Manager → Metadata → Bucket (old table before new table). The metadata
//! lock may also be taken as a leaf while a bucket is locked.

mod bucket;
mod core;
mod events;
mod executor;
mod frequency;
mod hasher;
mod manager;
mod metadata;
mod metrics;
mod plain;
mod rebalancer;
mod table;
mod tasks;
mod transaction;
mod transactional;
mod value;

#[cfg(test)]
mod proptest;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use self::bucket::{
    BlacklistMarker, BucketState, MarkerOverflow, Slot, BLACKLIST_SLOTS, SLOTS_PER_BUCKET,
};
pub use self::core::{BlacklistPolicy, CacheCore, CacheStats};
pub use events::{
    CacheEvent, CompositeEventSink, EventKind, EventSink, InMemoryEventCollector,
    LoggingEventSink, NullEventSink,
};
pub use executor::{Executor, Job, ManualExecutor, TokioExecutor, WorkerPool};
pub use frequency::FrequencyBuffer;
pub use hasher::{BinaryKeyHasher, KeyHasher, StructuredKeyHasher};
pub use manager::{
    Manager, MemoryStats, CACHE_RECORD_OVERHEAD, HIGHWATER_MULTIPLIER, MANAGER_MIN_SIZE,
    MIN_CACHE_ALLOCATION,
};
pub use metadata::Metadata;
pub use metrics::{ManagerMetrics, MetricsSnapshot, PrometheusExporter, TaskKind};
pub use plain::{PlainCache, PlainPolicy};
pub use rebalancer::Rebalancer;
pub use table::{BucketGuard, Table, TableError, MAX_LOG_SIZE, MIN_LOG_SIZE};
pub use transaction::{Transaction, TransactionManager, TransactionStats};
pub use transactional::{TransactionalCache, TransactionalPolicy};
pub use value::{CachedValue, Finding};

/// Smallest usage limit a cache is ever given (16 KiB)
pub const MIN_SIZE: u64 = 16 * 1024;

/// Capacity of a cache's own windowed find statistics
pub const CACHE_FIND_STATS_CAPACITY: usize = 1024;

/// Kind of cache created by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Blacklisting is a simple fixed-size marker ring
    Plain,
    /// Blacklist markers are scoped to transaction terms
    Transactional,
}

/// Value recorded in windowed find statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Stat {
    FindHit = 1,
    FindMiss = 2,
}

impl Stat {
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Why an insert did not store its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Value exceeds the cache's `max_value_size`
    ValueTooLarge,
    /// The cache is shut down or its table is unavailable
    Disabled,
    /// A blacklist marker covers the key's hash
    Blacklisted,
    /// No usage could be reserved, even after evicting from the bucket
    WouldExceedBudget,
}

/// Result of [`Cache::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
    Rejected(RejectReason),
}

impl InsertOutcome {
    /// Whether the record is now stored
    pub fn is_stored(&self) -> bool {
        matches!(self, InsertOutcome::Inserted | InsertOutcome::Replaced)
    }
}

/// Lifetime and windowed hit rate in percent; NaN means no data
pub(crate) fn hit_rates_from(hits: u64, misses: u64, window: Option<&FrequencyBuffer>) -> (f64, f64) {
    let lifetime = if hits + misses > 0 {
        100.0 * hits as f64 / (hits + misses) as f64
    } else {
        f64::NAN
    };
    let windowed = match window {
        Some(buffer) => {
            let frequencies = buffer.get_frequencies();
            let count = |stat: Stat| {
                frequencies
                    .iter()
                    .find(|(value, _)| *value == stat.as_u64())
                    .map_or(0, |(_, count)| *count)
            };
            let (hits, misses) = (count(Stat::FindHit), count(Stat::FindMiss));
            if hits + misses > 0 {
                100.0 * hits as f64 / (hits + misses) as f64
            } else {
                f64::NAN
            }
        }
        None => f64::NAN,
    };
    (lifetime, windowed)
}

/// A cache registered with a [`Manager`]
///
/// Handles are `Arc<dyn Cache>`; the manager keeps one per registered cache.
/// Data operations never fail with an error: misses, rejections and
/// removals of absent keys are ordinary outcomes.
pub trait Cache: Send + Sync {
    /// Identifier assigned by the manager
    fn id(&self) -> u64;

    fn cache_type(&self) -> CacheType;

    /// Look up `key`
    fn find(&self, key: &[u8]) -> Option<Finding>;

    /// Store `value` under `key`
    fn insert(&self, key: &[u8], value: &[u8]) -> InsertOutcome;

    /// Remove `key`; also clears a blacklist marker for its hash
    fn remove(&self, key: &[u8]) -> bool;

    /// Remove `key` and refuse inserts with its hash until the marker expires
    fn blacklist(&self, key: &[u8]);

    /// Memory currently charged to the global budget
    fn size(&self) -> u64;

    /// Bytes held by records
    fn usage(&self) -> u64;

    /// Lifetime and windowed hit rate in percent (NaN when no data)
    fn hit_rates(&self) -> (f64, f64);

    fn is_shutdown(&self) -> bool;

    fn stats(&self) -> CacheStats;

    // -------------------------------------------------------------------------
    // Manager hooks
    // -------------------------------------------------------------------------

    /// Memory accounting shared with the manager
    fn metadata(&self) -> &crate::sync::SpinLock<Metadata>;

    /// Evict records until usage drops to the soft limit
    ///
    /// Returns false when the cache was already shut down.
    fn free_memory(&self) -> bool;

    /// Move every record into `table` and make it the active table
    fn migrate(&self, table: Arc<Table>) -> bool;

    /// Release the table and unregister from the manager
    fn shutdown(&self);
}

impl std::fmt::Debug for dyn Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id())
            .field("cache_type", &self.cache_type())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_type_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&CacheType::Transactional).unwrap(), "\"transactional\"");
        let back: CacheType = serde_json::from_str("\"plain\"").unwrap();
        assert_eq!(back, CacheType::Plain);
    }

    #[test]
    fn test_insert_outcome_is_stored() {
        assert!(InsertOutcome::Inserted.is_stored());
        assert!(InsertOutcome::Replaced.is_stored());
        assert!(!InsertOutcome::Rejected(RejectReason::Blacklisted).is_stored());
    }

    #[test]
    fn test_hit_rates_without_data_are_nan() {
        let (lifetime, windowed) = hit_rates_from(0, 0, None);
        assert!(lifetime.is_nan());
        assert!(windowed.is_nan());
    }

    #[test]
    fn test_hit_rates_windowed() {
        let buffer = FrequencyBuffer::new(1);
        buffer.insert_record(Stat::FindHit.as_u64());
        let (lifetime, windowed) = hit_rates_from(3, 1, Some(&buffer));
        assert_eq!(lifetime, 75.0);
        assert_eq!(windowed, 100.0);

        buffer.insert_record(Stat::FindMiss.as_u64());
        assert_eq!(hit_rates_from(0, 0, Some(&buffer)).1, 0.0);
    }
}
