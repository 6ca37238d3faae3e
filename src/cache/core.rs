//! Cache Core
//!
//! Shared implementation of plain and transactional caches. The two differ
//! only in how blacklist markers are scoped, which is captured by a
//! [`BlacklistPolicy`]; everything else (lookup, insert with eviction,
//! memory accounting, free-memory and migration work) lives here.
//!
//! # Write path
//!
//! ```text
//! insert(key, value)
//!   │ construct record (no lock held)
//!   ▼
//! lock bucket in active table ──migrating──▶ also lock bucket in auxiliary
//!   │                                          (old before new)
//!   ▼
//! blacklisted? ─▶ Rejected(Blacklisted)
//!   │
//! reserve usage (metadata lock, leaf) ─refused─▶ evict colder slots, retry
//!   │                                              │ still refused
//!   ▼                                              ▼
//! install into target bucket               request_grow, WouldExceedBudget
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace};

use super::bucket::MarkerOverflow;
use super::frequency::FrequencyBuffer;
use super::hasher::KeyHasher;
use super::manager::Manager;
use super::metadata::Metadata;
use super::table::{BucketGuard, Table, MAX_LOG_SIZE, MIN_LOG_SIZE};
use super::value::{CachedValue, Finding};
use super::{
    hit_rates_from, Cache, CacheType, InsertOutcome, RejectReason, Stat,
    CACHE_FIND_STATS_CAPACITY,
};
use crate::sync::{SpinLock, TRIES_FAST};

/// Inserts (or removals) between table size checks
const RESIZE_CHECK_INTERVAL: u64 = 1024;

/// Eviction share above which the table is considered undersized
const EVICTION_RATE_THRESHOLD: f64 = 0.01;

/// Buckets sampled per free-memory round
const FREE_MEMORY_SAMPLES: usize = 4;

/// Poll interval while shutdown waits for background tasks
const SHUTDOWN_POLL: Duration = Duration::from_micros(10);

/// How a cache scopes its blacklist markers
pub trait BlacklistPolicy: Send + Sync + 'static {
    const CACHE_TYPE: CacheType;

    /// Term recorded on a new marker
    fn marker_term(&self) -> u64;

    /// Bring a freshly locked bucket up to date before it is used
    fn refresh(&self, bucket: &mut BucketGuard<'_>);

    /// What a full marker ring does with one more marker
    fn overflow(&self) -> MarkerOverflow;
}

/// Point-in-time view of one cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub id: u64,
    pub cache_type: CacheType,
    pub hasher: &'static str,
    pub entries: u64,
    pub log_size: u32,
    pub metadata: Metadata,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

/// Hash-table cache parameterised by key hasher and blacklist policy
pub struct CacheCore<H: KeyHasher, P: BlacklistPolicy> {
    id: u64,
    manager: Weak<Manager>,
    self_ref: Weak<Self>,
    policy: P,
    metadata: SpinLock<Metadata>,
    /// Active table; `None` once shut down
    table: RwLock<Option<Arc<Table>>>,
    shutdown: AtomicBool,
    max_value_size: u64,

    // Statistics
    hits: AtomicU64,
    misses: AtomicU64,
    find_stats: Option<FrequencyBuffer>,
    inserts: AtomicU64,
    evictions: AtomicU64,
    inserts_since_check: AtomicU64,
    evictions_since_check: AtomicU64,
    removals_since_check: AtomicU64,

    // Earliest time the manager accepts another request
    grow_retry_at: Mutex<Instant>,
    migrate_retry_at: Mutex<Instant>,

    _hasher: PhantomData<fn() -> H>,
}

impl<H: KeyHasher, P: BlacklistPolicy> CacheCore<H, P> {
    pub(crate) fn create(
        manager: Weak<Manager>,
        id: u64,
        metadata: Metadata,
        table: Arc<Table>,
        policy: P,
        enable_windowed_stats: bool,
        max_value_size: u64,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new_cyclic(|self_ref| Self {
            id,
            manager,
            self_ref: self_ref.clone(),
            policy,
            metadata: SpinLock::new(metadata),
            table: RwLock::new(Some(table)),
            shutdown: AtomicBool::new(false),
            max_value_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            find_stats: enable_windowed_stats
                .then(|| FrequencyBuffer::new(CACHE_FIND_STATS_CAPACITY)),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inserts_since_check: AtomicU64::new(0),
            evictions_since_check: AtomicU64::new(0),
            removals_since_check: AtomicU64::new(0),
            grow_retry_at: Mutex::new(now),
            migrate_retry_at: Mutex::new(now),
            _hasher: PhantomData,
        })
    }

    /// Fixed memory of one cache object, charged as `fixed_size`
    pub const fn allocation_size(enable_windowed_stats: bool) -> u64 {
        let stats = if enable_windowed_stats {
            FrequencyBuffer::memory_for(CACHE_FIND_STATS_CAPACITY)
        } else {
            0
        };
        std::mem::size_of::<Self>() as u64 + stats
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn current_table(&self) -> Option<Arc<Table>> {
        self.table.read().clone()
    }

    fn release_usage(&self, bytes: u64) {
        if bytes > 0 {
            self.metadata
                .lock()
                .adjust_usage_if_allowed(-(bytes.min(i64::MAX as u64) as i64));
        }
    }

    fn usage_over_soft_limit(&self) -> bool {
        let meta = self.metadata.lock();
        meta.usage > meta.soft_usage_limit
    }

    /// Background work should stop at the next bucket boundary
    fn should_stop(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
            || self
                .manager
                .upgrade()
                .map_or(true, |manager| manager.is_shutting_down())
    }

    fn as_dyn(&self) -> Option<Arc<dyn Cache>> {
        let me: Arc<dyn Cache> = self.self_ref.upgrade()?;
        Some(me)
    }

    // =========================================================================
    // Bucket resolution
    // =========================================================================

    /// Read-locked lookup honouring migration redirects
    fn lookup_record(&self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        let mut table = self.current_table()?;
        loop {
            let mut guard = table.lock_bucket(hash);
            self.policy.refresh(&mut guard);
            let auxiliary = table.auxiliary();

            if guard.is_migrated() {
                drop(guard);
                match auxiliary {
                    Some(next) => {
                        let mut target = next.lock_bucket(hash);
                        self.policy.refresh(&mut target);
                        return target.lookup::<H>(hash, key);
                    }
                    None => {
                        // migration finished between reading the table and locking
                        let current = self.current_table()?;
                        if Arc::ptr_eq(&current, &table) {
                            return None;
                        }
                        table = current;
                        continue;
                    }
                }
            }

            if let Some(found) = guard.lookup::<H>(hash, key) {
                return Some(found);
            }
            drop(guard);
            return auxiliary.and_then(|next| {
                let mut target = next.lock_bucket(hash);
                self.policy.refresh(&mut target);
                target.lookup::<H>(hash, key)
            });
        }
    }

    /// Lock the buckets a write to `hash` must touch and run `f`
    ///
    /// `f` receives the old-table bucket (only while it still holds data
    /// being migrated) and the bucket writes go to. Returns `None` when no
    /// usable table exists.
    fn with_write_buckets<R>(
        &self,
        hash: u64,
        f: impl FnOnce(Option<&mut BucketGuard<'_>>, &mut BucketGuard<'_>) -> R,
    ) -> Option<R> {
        let mut table = self.current_table()?;
        loop {
            let mut guard = table.lock_bucket(hash);
            self.policy.refresh(&mut guard);

            if let Some(next) = table.auxiliary() {
                let mut target = next.lock_bucket(hash);
                self.policy.refresh(&mut target);
                if guard.is_migrated() {
                    drop(guard);
                    return Some(f(None, &mut target));
                }
                return Some(f(Some(&mut guard), &mut target));
            }

            if guard.is_migrated() {
                drop(guard);
                let current = self.current_table()?;
                if Arc::ptr_eq(&current, &table) {
                    return None;
                }
                table = current;
                continue;
            }
            return Some(f(None, &mut guard));
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    fn record_find(&self, hit: bool) {
        let stat = if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Stat::FindHit
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Stat::FindMiss
        };
        if let Some(buffer) = &self.find_stats {
            buffer.insert_record(stat.as_u64());
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.report_access(self.id);
            manager.report_hit_stat(stat);
        }
    }

    /// Check eviction rate and fill after every interval of inserts
    fn after_insert(&self, evicted: u64) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.evictions_since_check
                .fetch_add(evicted, Ordering::Relaxed);
        }
        let inserts = self.inserts_since_check.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts < RESIZE_CHECK_INTERVAL {
            return;
        }
        self.inserts_since_check.store(0, Ordering::Relaxed);
        let evictions = self.evictions_since_check.swap(0, Ordering::Relaxed);

        let Some(table) = self.current_table() else {
            return;
        };
        let log_size = table.log_size();
        let ideal = table.ideal_log_size();
        let eviction_rate = evictions as f64 / inserts as f64;
        if ideal > log_size {
            self.request_migrate(ideal);
        } else if eviction_rate > EVICTION_RATE_THRESHOLD && log_size < MAX_LOG_SIZE {
            trace!(cache_id = self.id, eviction_rate, "High eviction rate");
            self.request_migrate(log_size + 1);
        }
    }

    fn after_remove(&self) {
        let removals = self.removals_since_check.fetch_add(1, Ordering::Relaxed) + 1;
        if removals < RESIZE_CHECK_INTERVAL {
            return;
        }
        self.removals_since_check.store(0, Ordering::Relaxed);
        if let Some(table) = self.current_table() {
            let ideal = table.ideal_log_size();
            if ideal < table.log_size() && ideal >= MIN_LOG_SIZE {
                self.request_migrate(ideal);
            }
        }
    }

    // =========================================================================
    // Manager requests
    // =========================================================================

    fn request_grow(&self) {
        if self.is_shutdown() {
            return;
        }
        let Some(mut retry_at) = self.grow_retry_at.try_lock() else {
            return;
        };
        if Instant::now() < *retry_at {
            return;
        }
        let (Some(manager), Some(me)) = (self.manager.upgrade(), self.as_dyn()) else {
            return;
        };
        let (granted, next) = manager.request_grow(&me);
        trace!(cache_id = self.id, granted, "Grow requested");
        *retry_at = next;
    }

    fn request_migrate(&self, log_size: u32) {
        if self.is_shutdown() {
            return;
        }
        let Some(mut retry_at) = self.migrate_retry_at.try_lock() else {
            return;
        };
        if Instant::now() < *retry_at {
            return;
        }
        let (Some(manager), Some(me)) = (self.manager.upgrade(), self.as_dyn()) else {
            return;
        };
        let (granted, next) = manager.request_migrate(&me, log_size);
        trace!(cache_id = self.id, log_size, granted, "Migration requested");
        *retry_at = next;
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Move one bucket of `old` into `new`
    fn migrate_bucket(&self, old: &Table, new: &Table, index: usize) {
        let overflow = self.policy.overflow();
        let mut source = old.lock_bucket_at(index);
        self.policy.refresh(&mut source);
        if source.is_migrated() {
            return;
        }

        let mut released = 0u64;
        for (hash, record, freshness) in source.drain() {
            let mut target = new.lock_bucket(hash);
            self.policy.refresh(&mut target);
            // a newer write or a marker in the new table wins
            if target.find::<H>(hash, record.key()).is_some() || target.is_blacklisted(hash) {
                released += record.size();
                continue;
            }
            let slot = match target.state().empty_slot() {
                Some(slot) => slot,
                None => match target.state().coldest() {
                    Some(slot) => {
                        if let Some(evicted) = target.take(slot) {
                            released += evicted.size();
                            self.evictions.fetch_add(1, Ordering::Relaxed);
                        }
                        slot
                    }
                    None => {
                        released += record.size();
                        continue;
                    }
                },
            };
            target.install_with_freshness(slot, hash, record, freshness);
        }

        let (markers, saturated) = source.state_mut().take_markers();
        for marker in markers {
            let mut target = new.lock_bucket(marker.hash);
            self.policy.refresh(&mut target);
            if marker.term >= target.state().term() {
                target
                    .state_mut()
                    .add_marker(marker.hash, marker.term, overflow);
            }
        }
        if saturated {
            let (old_log, new_log) = (old.log_size(), new.log_size());
            let targets = if new_log >= old_log {
                let shift = new_log - old_log;
                (index << shift)..((index + 1) << shift)
            } else {
                let first = index >> (old_log - new_log);
                first..first + 1
            };
            for target_index in targets {
                let mut target = new.lock_bucket_at(target_index);
                self.policy.refresh(&mut target);
                target.state_mut().saturate();
            }
        }

        source.state_mut().set_migrated();
        drop(source);
        self.release_usage(released);
    }

    fn abort_migration(&self, old: &Table) -> bool {
        old.set_auxiliary(None);
        self.metadata.lock().toggle_migrating();
        debug!(cache_id = self.id, "Migration aborted by shutdown");
        false
    }
}

impl<H: KeyHasher, P: BlacklistPolicy> Cache for CacheCore<H, P> {
    fn id(&self) -> u64 {
        self.id
    }

    fn cache_type(&self) -> CacheType {
        P::CACHE_TYPE
    }

    fn find(&self, key: &[u8]) -> Option<Finding> {
        if self.is_shutdown() {
            return None;
        }
        let found = self.lookup_record(H::hash_key(key), key);
        self.record_find(found.is_some());
        found.map(Finding::new)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> InsertOutcome {
        if self.is_shutdown() {
            return InsertOutcome::Rejected(RejectReason::Disabled);
        }
        if value.len() as u64 > self.max_value_size {
            return InsertOutcome::Rejected(RejectReason::ValueTooLarge);
        }
        let hash = H::hash_key(key);
        let record = CachedValue::construct(key, value);
        let size = record.size();
        let mut evicted = 0u64;

        let outcome = self.with_write_buckets(hash, |old, target| {
            let old_blacklisted = old.as_ref().is_some_and(|g| g.is_blacklisted(hash));
            if old_blacklisted || target.is_blacklisted(hash) {
                return InsertOutcome::Rejected(RejectReason::Blacklisted);
            }

            let in_target = target.find::<H>(hash, key);
            let in_old = old.as_ref().and_then(|g| g.find::<H>(hash, key));
            let victim = match in_target {
                Some(_) => None,
                None if target.state().empty_slot().is_some() => None,
                None => target.state().coldest(),
            };
            let replaced = in_target.map_or(0, |i| target.state().slot_size(i))
                + match (old.as_ref(), in_old) {
                    (Some(g), Some(i)) => g.state().slot_size(i),
                    _ => 0,
                };
            let freed = victim.map_or(0, |i| target.state().slot_size(i));
            let delta = size as i64 - replaced as i64 - freed as i64;

            // reserve, giving up colder neighbours when over the limit
            while !self.metadata.lock().adjust_usage_if_allowed(delta) {
                match target.state().coldest_excluding(&[in_target, victim]) {
                    Some(index) => {
                        if let Some(record) = target.take(index) {
                            self.release_usage(record.size());
                            evicted += 1;
                        }
                    }
                    None => return InsertOutcome::Rejected(RejectReason::WouldExceedBudget),
                }
            }

            let Some(slot) = in_target
                .or(victim)
                .or_else(|| target.state().empty_slot())
            else {
                // unreachable while the bucket had room; undo the reservation
                self.metadata.lock().adjust_usage_if_allowed(-delta);
                return InsertOutcome::Rejected(RejectReason::WouldExceedBudget);
            };
            if let (Some(guard), Some(index)) = (old, in_old) {
                guard.take(index);
            }
            target.install(slot, hash, record);
            if victim.is_some() {
                evicted += 1;
            }
            if in_target.is_some() || in_old.is_some() {
                InsertOutcome::Replaced
            } else {
                InsertOutcome::Inserted
            }
        });

        let outcome = outcome.unwrap_or(InsertOutcome::Rejected(RejectReason::Disabled));
        match outcome {
            InsertOutcome::Inserted | InsertOutcome::Replaced => self.after_insert(evicted),
            InsertOutcome::Rejected(RejectReason::WouldExceedBudget) => {
                if evicted > 0 {
                    self.evictions.fetch_add(evicted, Ordering::Relaxed);
                }
                self.request_grow();
            }
            InsertOutcome::Rejected(_) => {}
        }
        outcome
    }

    fn remove(&self, key: &[u8]) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let hash = H::hash_key(key);
        let removed = self.with_write_buckets(hash, |old, target| {
            let mut freed = 0u64;
            if let Some(guard) = old {
                if let Some(record) = guard.remove::<H>(hash, key) {
                    freed += record.size();
                }
                guard.state_mut().clear_marker(hash);
            }
            if let Some(record) = target.remove::<H>(hash, key) {
                freed += record.size();
            }
            target.state_mut().clear_marker(hash);
            freed
        });
        match removed {
            Some(freed) if freed > 0 => {
                self.release_usage(freed);
                self.after_remove();
                true
            }
            _ => false,
        }
    }

    fn blacklist(&self, key: &[u8]) {
        if self.is_shutdown() {
            return;
        }
        let hash = H::hash_key(key);
        let term = self.policy.marker_term();
        let overflow = self.policy.overflow();
        let freed = self.with_write_buckets(hash, |old, target| {
            let mut freed: u64 = 0;
            if let Some(guard) = old {
                freed += guard.remove_hash(hash).iter().map(|r| r.size()).sum::<u64>();
            }
            freed += target
                .blacklist(hash, term, overflow)
                .iter()
                .map(|r| r.size())
                .sum::<u64>();
            freed
        });
        if let Some(freed) = freed {
            self.release_usage(freed);
        }
    }

    fn size(&self) -> u64 {
        self.metadata.lock().allocated_size
    }

    fn usage(&self) -> u64 {
        self.metadata.lock().usage
    }

    fn hit_rates(&self) -> (f64, f64) {
        hit_rates_from(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.find_stats.as_ref(),
        )
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn stats(&self) -> CacheStats {
        let table = self.current_table();
        CacheStats {
            id: self.id,
            cache_type: P::CACHE_TYPE,
            hasher: H::NAME,
            entries: table.as_ref().map_or(0, |t| t.occupied()),
            log_size: table.as_ref().map_or(0, |t| t.log_size()),
            metadata: self.metadata.lock().clone(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn metadata(&self) -> &SpinLock<Metadata> {
        &self.metadata
    }

    fn free_memory(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let Some(table) = self.current_table() else {
            return false;
        };
        let max_visits = 4 * table.size();
        let mut visits = 0usize;
        let mut released = 0u64;
        let mut rng = rand::rng();

        while visits < max_visits && self.usage_over_soft_limit() {
            if self.should_stop() {
                break;
            }
            let candidate = match table.auxiliary() {
                Some(next) if rng.random_bool(0.5) => next,
                _ => Arc::clone(&table),
            };

            let mut coldest: Option<(usize, f64)> = None;
            for _ in 0..FREE_MEMORY_SAMPLES {
                let index = rng.random_range(0..candidate.size());
                visits += 1;
                if let Some(guard) = candidate.try_lock_bucket_at(index, TRIES_FAST) {
                    if let Some(average) = guard.state().average_freshness() {
                        if coldest.map_or(true, |(_, best)| average < best) {
                            coldest = Some((index, average));
                        }
                    }
                }
            }
            let Some((index, _)) = coldest else {
                continue;
            };

            let mut guard = candidate.lock_bucket_at(index);
            if guard.is_migrated() {
                continue;
            }
            while let Some(slot) = guard.state().coldest() {
                if !self.usage_over_soft_limit() {
                    break;
                }
                if let Some(record) = guard.take(slot) {
                    self.release_usage(record.size());
                    released += record.size();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        debug!(cache_id = self.id, visits, released, "Freed memory");
        true
    }

    fn migrate(&self, new_table: Arc<Table>) -> bool {
        let old = match self.current_table() {
            Some(old) if !self.should_stop() => old,
            _ => {
                self.metadata.lock().toggle_migrating();
                return false;
            }
        };
        old.set_auxiliary(Some(Arc::clone(&new_table)));

        for index in 0..old.size() {
            if self.should_stop() {
                return self.abort_migration(&old);
            }
            self.migrate_bucket(&old, &new_table, index);
        }

        *self.table.write() = Some(Arc::clone(&new_table));
        old.set_auxiliary(None);
        {
            let mut meta = self.metadata.lock();
            meta.change_table(new_table.memory_usage());
            meta.toggle_migrating();
        }
        debug!(
            cache_id = self.id,
            from = old.log_size(),
            to = new_table.log_size(),
            "Migrated table"
        );
        if let Some(manager) = self.manager.upgrade() {
            manager.reclaim_table(old);
        }
        true
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // background tasks observe the flag at their next bucket boundary
        loop {
            {
                let meta = self.metadata.lock();
                if !meta.is_migrating() && !meta.is_resizing() {
                    break;
                }
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        let manager = self.manager.upgrade();
        let table = self.table.write().take();
        if let Some(table) = table {
            debug_assert!(table.auxiliary().is_none());
            table.clear();
            {
                let mut meta = self.metadata.lock();
                meta.usage = 0;
                meta.change_table(0);
            }
            if let Some(manager) = &manager {
                manager.reclaim_table(table);
            }
        }
        if let Some(manager) = manager {
            manager.unregister_cache(self.id);
        }
        debug!(cache_id = self.id, "Cache shut down");
    }
}

impl<H: KeyHasher, P: BlacklistPolicy> std::fmt::Debug for CacheCore<H, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("id", &self.id)
            .field("cache_type", &P::CACHE_TYPE)
            .field("hasher", &H::NAME)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
