//! Hash Table
//!
//! Fixed power-of-two array of buckets. A table never changes shape; a
//! cache grows or shrinks by migrating into a freshly leased table.
//!
//! # Layout
//!
//! ```text
//! hash (64 bits)
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ log_size bits│                 remaining bits                │
//! └──────┬───────┴───────────────────────────────────────────────┘
//!        │ bucket index = hash >> (64 - log_size)
//!        ▼
//! ┌────────┬────────┬────────┬─────┐      ┌─────────────────────────┐
//! │bucket 0│bucket 1│bucket 2│ ... │ ───▶ │ auxiliary table (while  │
//! └────────┴────────┴────────┴─────┘      │ migrating)              │
//!   8 slots + spin lock + markers         └─────────────────────────┘
//! ```
//!
//! While a migration runs, the old table's auxiliary pointer references the
//! new table. Buckets that have been moved carry the migrated bit and
//! operations on them are redirected.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::bucket::{BucketState, MarkerOverflow, Slot, SLOTS_PER_BUCKET};
use super::hasher::KeyHasher;
use super::value::CachedValue;
use crate::sync::{SpinGuard, SpinLock};

/// Smallest table: 256 buckets
pub const MIN_LOG_SIZE: u32 = 8;

/// Largest table shape
pub const MAX_LOG_SIZE: u32 = 32;

/// Grow when more than this share of slots is occupied
pub const IDEAL_UPPER_RATIO: f64 = 0.5;

/// Shrink when less than this share of slots is occupied
pub const IDEAL_LOWER_RATIO: f64 = 0.04;

/// Failure of a table-level insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// No slot available and eviction not permitted
    Full,
    /// The hash is blacklisted in its bucket
    Blacklisted,
}

/// Cache-line aligned bucket
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct Bucket {
    state: SpinLock<BucketState>,
}

/// Locked bucket; the lock is released on drop
pub struct BucketGuard<'a> {
    table: &'a Table,
    index: usize,
    state: SpinGuard<'a, BucketState>,
}

impl<'a> BucketGuard<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    pub fn state(&self) -> &BucketState {
        &self.state
    }

    /// Mutable access to the bucket contents
    ///
    /// Slot counts are tracked by the guard's own methods; callers going
    /// through this must use [`BucketGuard::take`] / [`BucketGuard::install`]
    /// for slot changes.
    pub(crate) fn state_mut(&mut self) -> &mut BucketState {
        &mut self.state
    }

    pub fn find<H: KeyHasher>(&self, hash: u64, key: &[u8]) -> Option<usize> {
        self.state.find_slot::<H>(hash, key)
    }

    pub fn lookup<H: KeyHasher>(&mut self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        self.state.lookup::<H>(hash, key)
    }

    /// Install into `index`; returns the displaced record
    pub fn install(
        &mut self,
        index: usize,
        hash: u64,
        record: Arc<CachedValue>,
    ) -> Option<Arc<CachedValue>> {
        let displaced = self.state.install(index, hash, record);
        if displaced.is_none() {
            self.table.occupied.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    pub(crate) fn install_with_freshness(
        &mut self,
        index: usize,
        hash: u64,
        record: Arc<CachedValue>,
        freshness: u8,
    ) -> Option<Arc<CachedValue>> {
        let displaced = self
            .state
            .install_with_freshness(index, hash, record, freshness);
        if displaced.is_none() {
            self.table.occupied.fetch_add(1, Ordering::Relaxed);
        }
        displaced
    }

    pub fn take(&mut self, index: usize) -> Option<Arc<CachedValue>> {
        let taken = self.state.take(index);
        if taken.is_some() {
            self.table.occupied.fetch_sub(1, Ordering::Relaxed);
        }
        taken
    }

    /// Insert `record`, replacing an equal key or evicting the coldest slot
    /// when `allow_evict` is set. Returns the replaced or evicted record.
    pub fn insert<H: KeyHasher>(
        &mut self,
        hash: u64,
        record: Arc<CachedValue>,
        allow_evict: bool,
    ) -> Result<Option<Arc<CachedValue>>, TableError> {
        if self.state.is_blacklisted(hash) {
            return Err(TableError::Blacklisted);
        }
        if let Some(index) = self.state.find_slot::<H>(hash, record.key()) {
            return Ok(self.install(index, hash, record));
        }
        if let Some(index) = self.state.empty_slot() {
            return Ok(self.install(index, hash, record));
        }
        if !allow_evict {
            return Err(TableError::Full);
        }
        match self.state.coldest() {
            Some(index) => Ok(self.install(index, hash, record)),
            None => Err(TableError::Full),
        }
    }

    pub fn remove<H: KeyHasher>(&mut self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        let index = self.state.find_slot::<H>(hash, key)?;
        self.take(index)
    }

    pub fn remove_hash(&mut self, hash: u64) -> Vec<Arc<CachedValue>> {
        let removed = self.state.remove_hash(hash);
        self.table
            .occupied
            .fetch_sub(removed.len() as i64, Ordering::Relaxed);
        removed
    }

    pub fn drain(&mut self) -> Vec<(u64, Arc<CachedValue>, u8)> {
        let drained = self.state.drain();
        self.table
            .occupied
            .fetch_sub(drained.len() as i64, Ordering::Relaxed);
        drained
    }

    /// Remove any record for `hash` and install a blacklist marker
    pub fn blacklist(
        &mut self,
        hash: u64,
        term: u64,
        overflow: MarkerOverflow,
    ) -> Vec<Arc<CachedValue>> {
        let removed = self.remove_hash(hash);
        self.state.add_marker(hash, term, overflow);
        removed
    }

    pub fn is_blacklisted(&self, hash: u64) -> bool {
        self.state.is_blacklisted(hash)
    }

    pub fn is_migrated(&self) -> bool {
        self.state.is_migrated()
    }
}

// =============================================================================
// Table
// =============================================================================

/// Power-of-two bucket array
pub struct Table {
    log_size: u32,
    buckets: Box<[Bucket]>,
    auxiliary: RwLock<Option<Arc<Table>>>,
    /// Occupied slots across all buckets
    occupied: AtomicI64,
}

impl Table {
    /// Allocate an empty table with `2^log_size` buckets
    pub fn new(log_size: u32) -> Self {
        debug_assert!((MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size));
        let log_size = log_size.clamp(MIN_LOG_SIZE, MAX_LOG_SIZE);
        let buckets = (0..(1usize << log_size)).map(|_| Bucket::default()).collect();
        Self {
            log_size,
            buckets,
            auxiliary: RwLock::new(None),
            occupied: AtomicI64::new(0),
        }
    }

    /// Bytes a table of the given shape occupies
    pub const fn allocation_size(log_size: u32) -> u64 {
        std::mem::size_of::<Table>() as u64
            + ((std::mem::size_of::<Bucket>() as u64) << log_size)
    }

    pub fn memory_usage(&self) -> u64 {
        Self::allocation_size(self.log_size)
    }

    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    /// Number of buckets
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn slot_count(&self) -> usize {
        self.buckets.len() * SLOTS_PER_BUCKET
    }

    pub fn occupied(&self) -> u64 {
        self.occupied.load(Ordering::Relaxed).max(0) as u64
    }

    #[inline]
    pub fn bucket_index(&self, hash: u64) -> usize {
        (hash >> (64 - self.log_size)) as usize
    }

    pub fn lock_bucket(&self, hash: u64) -> BucketGuard<'_> {
        self.lock_bucket_at(self.bucket_index(hash))
    }

    pub fn lock_bucket_at(&self, index: usize) -> BucketGuard<'_> {
        BucketGuard {
            table: self,
            index,
            state: self.buckets[index].state.lock(),
        }
    }

    pub fn try_lock_bucket_at(&self, index: usize, tries: usize) -> Option<BucketGuard<'_>> {
        let state = self.buckets[index].state.try_lock_for(tries)?;
        Some(BucketGuard {
            table: self,
            index,
            state,
        })
    }

    pub fn auxiliary(&self) -> Option<Arc<Table>> {
        self.auxiliary.read().clone()
    }

    /// Replace the auxiliary table, returning the previous one
    pub fn set_auxiliary(&self, table: Option<Arc<Table>>) -> Option<Arc<Table>> {
        std::mem::replace(&mut *self.auxiliary.write(), table)
    }

    /// Log size this table should have for its current fill
    pub fn ideal_log_size(&self) -> u32 {
        let fill = self.occupied() as f64 / self.slot_count() as f64;
        if fill > IDEAL_UPPER_RATIO && self.log_size < MAX_LOG_SIZE {
            self.log_size + 1
        } else if fill < IDEAL_LOWER_RATIO && self.log_size > MIN_LOG_SIZE {
            self.log_size - 1
        } else {
            self.log_size
        }
    }

    // -------------------------------------------------------------------------
    // Convenience operations (lock, act, release)
    // -------------------------------------------------------------------------

    pub fn lookup<H: KeyHasher>(&self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        self.lock_bucket(hash).lookup::<H>(hash, key)
    }

    pub fn insert<H: KeyHasher>(
        &self,
        hash: u64,
        record: Arc<CachedValue>,
    ) -> Result<Option<Arc<CachedValue>>, TableError> {
        self.lock_bucket(hash).insert::<H>(hash, record, true)
    }

    pub fn remove<H: KeyHasher>(&self, hash: u64, key: &[u8]) -> bool {
        self.lock_bucket(hash).remove::<H>(hash, key).is_some()
    }

    pub fn blacklist(&self, hash: u64, term: u64, overflow: MarkerOverflow) {
        self.lock_bucket(hash).blacklist(hash, term, overflow);
    }

    /// Run `f` on every occupied slot of bucket `index` under its lock
    pub fn scan_bucket(&self, index: usize, mut f: impl FnMut(&Slot)) {
        let guard = self.lock_bucket_at(index);
        for slot in guard.state().slots().iter().filter(|s| !s.is_empty()) {
            f(slot);
        }
    }

    /// Reset every bucket and drop the auxiliary pointer
    pub fn clear(&self) {
        self.set_auxiliary(None);
        for bucket in self.buckets.iter() {
            bucket.state.lock().reset();
        }
        self.occupied.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("log_size", &self.log_size)
            .field("occupied", &self.occupied())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
