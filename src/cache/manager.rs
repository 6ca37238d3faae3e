//! Cache Manager
//!
//! Owns the global memory budget and every registered cache. Caches call
//! back into the manager when they need more memory or a differently sized
//! table; the manager grants what fits below its high-water mark and hands
//! the actual work to background tasks.
//!
//! # Budget
//!
//! ```text
//! 0 ─────────── fixed ──────────── highwater (0.56 × soft) ──── soft ── hard
//!   manager overhead │ caches grow freely │ privileged only │ resize only
//! ```
//!
//! - `global_allocation` = fixed allocation + Σ cache allocations + spare
//!   tables + tables leased for running migrations
//! - non-privileged increases (growth requests) must stay below the
//!   high-water mark; privileged ones (cache creation, table leases) below
//!   the hard limit, or the soft limit while a resize is in progress
//!
//! # Rebalancing
//!
//! A rebalance divides the high-water mark between caches. Each cache gets a
//! base weight; the rest is split by sampled access frequency and by current
//! usage, weighted by how full the budget is. Caches allocated above their
//! new share are shrunk by free-memory tasks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::core::CacheCore;
use super::events::{CacheEvent, EventSink, NullEventSink};
use super::executor::Executor;
use super::frequency::FrequencyBuffer;
use super::hasher::{BinaryKeyHasher, KeyHasher};
use super::metadata::Metadata;
use super::metrics::ManagerMetrics;
use super::plain::PlainPolicy;
use super::table::{Table, MAX_LOG_SIZE, MIN_LOG_SIZE};
use super::tasks::{FreeMemoryTask, MigrateTask, TaskEnvironment};
use super::transaction::{Transaction, TransactionManager};
use super::transactional::TransactionalPolicy;
use super::{hit_rates_from, Cache, CacheType, Stat, MIN_SIZE};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::sync::{SpinGuard, SpinRwLock, TRIES_SLOW};

/// Smallest global limit a manager accepts (1 MiB)
pub const MANAGER_MIN_SIZE: u64 = 1024 * 1024;

/// Share of the soft limit caches may grow into freely
pub const HIGHWATER_MULTIPLIER: f64 = 0.56;

/// Manager-side bookkeeping charged per registered cache
pub const CACHE_RECORD_OVERHEAD: u64 =
    (std::mem::size_of::<Arc<dyn Cache>>() + 16 + std::mem::size_of::<u64>()) as u64;

/// Smallest allocation a cache can live with
pub const MIN_CACHE_ALLOCATION: u64 = MIN_SIZE
    + Table::allocation_size(MIN_LOG_SIZE)
    + max_u64(
        CacheCore::<BinaryKeyHasher, PlainPolicy>::allocation_size(true),
        CacheCore::<BinaryKeyHasher, TransactionalPolicy>::allocation_size(true),
    )
    + CACHE_RECORD_OVERHEAD;

/// Total number of tables kept in the pool
pub const MAX_SPARE_TABLES_TOTAL: u64 = 16;

/// Largest table the pool keeps (32 MiB)
const MAX_POOLED_TABLE_SIZE: u64 = 32 * 1024 * 1024;

/// Capacity of the global windowed find statistics
const FIND_STATS_CAPACITY: usize = 16384;

/// Per-log-size table lists
const TABLE_LISTS_OVERHEAD: u64 = 32 * 16 * 8;

/// Delay before a refused request may be repeated
const REQUEST_BACKOFF: Duration = Duration::from_millis(100);

/// Rebalancing shrinks caches only once allocation reaches this share of
/// the high-water mark
const SHRINK_THRESHOLD: f64 = 0.7;

/// Poll interval while shutdown waits for tasks
const SHUTDOWN_POLL: Duration = Duration::from_micros(10);

const fn max_u64(a: u64, b: u64) -> u64 {
    if a > b {
        a
    } else {
        b
    }
}

/// Maximum number of pooled tables of one shape
fn max_pooled_tables(log_size: u32) -> usize {
    if log_size < 18 {
        1 << (18 - log_size)
    } else {
        1
    }
}

/// Snapshot of the manager's memory accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub global_limit: u64,
    pub global_allocation: u64,
    pub global_highwater_mark: u64,
    pub fixed_allocation: u64,
    pub spare_allocation: u64,
    pub active_tables: u64,
    pub spare_tables: u64,
    pub caches: u64,
}

// =============================================================================
// State
// =============================================================================

/// Everything guarded by the manager lock
pub(crate) struct ManagerState {
    shutting_down: bool,
    shutdown: bool,
    resizing: bool,
    rebalancing: bool,

    global_soft_limit: u64,
    global_hard_limit: u64,
    global_highwater_mark: u64,
    fixed_allocation: u64,
    spare_table_allocation: u64,
    global_allocation: u64,
    active_tables: u64,
    spare_tables: u64,

    caches: BTreeMap<u64, Arc<dyn Cache>>,
    /// Spare tables indexed by log size
    tables: Vec<Vec<Arc<Table>>>,
    next_cache_id: u64,
    rebalance_completed: Option<Instant>,
}

impl ManagerState {
    fn is_operational(&self) -> bool {
        !self.shutting_down && !self.shutdown
    }

    fn global_process_running(&self) -> bool {
        self.rebalancing || self.resizing
    }

    fn global_limit(&self) -> u64 {
        if self.resizing {
            self.global_soft_limit
        } else {
            self.global_hard_limit
        }
    }

    fn set_soft_limit(&mut self, limit: u64) {
        self.global_soft_limit = limit;
        self.global_highwater_mark = (HIGHWATER_MULTIPLIER * limit as f64) as u64;
    }

    /// Whether `increase` more bytes fit the budget
    fn increase_allowed(&self, increase: u64, privileged: bool) -> bool {
        let ceiling = if !privileged {
            self.global_highwater_mark
        } else if self.resizing && self.global_allocation <= self.global_soft_limit {
            self.global_soft_limit
        } else {
            self.global_hard_limit
        };
        increase <= ceiling.saturating_sub(self.global_allocation)
    }

    /// Move both limits to `limit` if the current allocation fits below it
    fn adjust_global_limits_if_allowed(&mut self, limit: u64) -> bool {
        if limit < self.global_allocation {
            return false;
        }
        self.set_soft_limit(limit);
        self.global_hard_limit = limit;
        true
    }

    fn add_allocation(&mut self, bytes: u64) {
        self.global_allocation += bytes;
    }

    fn release_allocation(&mut self, bytes: u64) {
        if self.global_allocation < bytes + self.fixed_allocation {
            error!(
                global_allocation = self.global_allocation,
                release = bytes,
                "Global allocation underflow"
            );
            debug_assert!(false, "global allocation underflow");
        }
        self.global_allocation = self
            .global_allocation
            .saturating_sub(bytes)
            .max(self.fixed_allocation);
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Coordinator of a set of caches sharing one memory budget
pub struct Manager {
    config: ManagerConfig,
    executor: Arc<dyn Executor>,
    events: Arc<dyn EventSink>,
    state: SpinRwLock<ManagerState>,
    self_ref: Weak<Manager>,

    access_stats: FrequencyBuffer,
    find_stats: Option<FrequencyBuffer>,
    find_hits: AtomicU64,
    find_misses: AtomicU64,

    transactions: Arc<TransactionManager>,

    /// Lock-free copy of `ManagerState::shutting_down` for background work
    shutting_down: AtomicBool,
    outstanding_tasks: AtomicU64,
    rebalancing_tasks: AtomicU64,
    resizing_tasks: AtomicU64,

    metrics: ManagerMetrics,
}

impl Manager {
    /// Create a manager that discards lifecycle events
    pub fn new(config: ManagerConfig, executor: Arc<dyn Executor>) -> Result<Arc<Self>> {
        Self::with_event_sink(config, executor, Arc::new(NullEventSink))
    }

    /// Create a manager publishing lifecycle events to `events`
    pub fn with_event_sink(
        config: ManagerConfig,
        executor: Arc<dyn Executor>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let limit = config.global_limit;
        if limit < MANAGER_MIN_SIZE {
            return Err(Error::InvalidLimit(limit));
        }
        config.validate()?;

        let access_capacity = if limit >= 1024 * 1024 * 1024 {
            (1024 * 1024) / 8
        } else {
            (limit / 8192) as usize
        };
        let access_stats = FrequencyBuffer::new(access_capacity);
        let find_stats = config
            .enable_windowed_stats
            .then(|| FrequencyBuffer::new(FIND_STATS_CAPACITY));

        let fixed_allocation = std::mem::size_of::<Manager>() as u64
            + TABLE_LISTS_OVERHEAD
            + access_stats.memory_usage()
            + find_stats.as_ref().map_or(0, FrequencyBuffer::memory_usage);
        if ((0.5 * (1.0 - HIGHWATER_MULTIPLIER) * limit as f64) as u64) < fixed_allocation {
            return Err(Error::InvalidLimit(limit));
        }

        let state = ManagerState {
            shutting_down: false,
            shutdown: false,
            resizing: false,
            rebalancing: false,
            global_soft_limit: limit,
            global_hard_limit: limit,
            global_highwater_mark: (HIGHWATER_MULTIPLIER * limit as f64) as u64,
            fixed_allocation,
            spare_table_allocation: 0,
            global_allocation: fixed_allocation,
            active_tables: 0,
            spare_tables: 0,
            caches: BTreeMap::new(),
            tables: (0..=MAX_LOG_SIZE).map(|_| Vec::new()).collect(),
            next_cache_id: 1,
            rebalance_completed: None,
        };

        let manager = Arc::new_cyclic(|self_ref| Manager {
            config,
            executor,
            events,
            state: SpinRwLock::new(state),
            self_ref: self_ref.clone(),
            access_stats,
            find_stats,
            find_hits: AtomicU64::new(0),
            find_misses: AtomicU64::new(0),
            transactions: Arc::new(TransactionManager::new()),
            shutting_down: AtomicBool::new(false),
            outstanding_tasks: AtomicU64::new(0),
            rebalancing_tasks: AtomicU64::new(0),
            resizing_tasks: AtomicU64::new(0),
            metrics: ManagerMetrics::new(),
        });
        info!(
            global_limit = limit,
            fixed_allocation,
            windowed_stats = manager.find_stats.is_some(),
            "Cache manager started"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    fn arc(&self) -> Option<Arc<Manager>> {
        self.self_ref.upgrade()
    }

    fn past_grace_period(&self, state: &ManagerState) -> bool {
        let grace = self.config.rebalancing_grace_period();
        state
            .rebalance_completed
            .map_or(true, |completed| completed.elapsed() >= grace)
    }

    // =========================================================================
    // Cache Lifecycle
    // =========================================================================

    /// Register a new cache of `cache_type` that may grow up to `max_size`
    #[instrument(skip(self), fields(hasher = H::NAME))]
    pub fn create_cache<H: KeyHasher>(
        &self,
        cache_type: CacheType,
        max_size: u64,
        enable_windowed_stats: bool,
    ) -> Result<Arc<dyn Cache>> {
        let mut state = self.state.write();
        if !state.is_operational() {
            return Err(Error::ShuttingDown);
        }
        if max_size < MIN_CACHE_ALLOCATION {
            return Err(Error::InvalidCacheSize {
                requested: max_size,
                minimum: MIN_CACHE_ALLOCATION,
            });
        }
        let share = state.global_highwater_mark / (state.caches.len() as u64 + 1);
        if share < MIN_CACHE_ALLOCATION {
            return Err(Error::BudgetExceeded {
                requested: MIN_CACHE_ALLOCATION,
                available: share,
            });
        }

        let table = self
            .lease_table(&mut state, MIN_LOG_SIZE)
            .ok_or_else(|| Error::BudgetExceeded {
                requested: Table::allocation_size(MIN_LOG_SIZE),
                available: state.global_limit().saturating_sub(state.global_allocation),
            })?;
        let fixed_size = match cache_type {
            CacheType::Plain => CacheCore::<H, PlainPolicy>::allocation_size(enable_windowed_stats),
            CacheType::Transactional => {
                CacheCore::<H, TransactionalPolicy>::allocation_size(enable_windowed_stats)
            }
        };
        let metadata = Metadata::new(MIN_SIZE, fixed_size, table.memory_usage(), max_size);
        let increase = metadata.allocated_size - table.memory_usage();
        if !state.increase_allowed(increase, true) {
            let available = state.global_limit().saturating_sub(state.global_allocation);
            let leftover = self.reclaim_table_locked(&mut state, table);
            drop(state);
            drop(leftover);
            return Err(Error::BudgetExceeded {
                requested: increase,
                available,
            });
        }
        state.add_allocation(increase);

        let id = state.next_cache_id;
        state.next_cache_id += 1;
        let manager = self.self_ref.clone();
        let max_value_size = self.config.max_value_size;
        let cache: Arc<dyn Cache> = match cache_type {
            CacheType::Plain => CacheCore::<H, PlainPolicy>::create(
                manager,
                id,
                metadata,
                table,
                PlainPolicy,
                enable_windowed_stats,
                max_value_size,
            ),
            CacheType::Transactional => CacheCore::<H, TransactionalPolicy>::create(
                manager,
                id,
                metadata,
                table,
                TransactionalPolicy::new(Arc::clone(&self.transactions)),
                enable_windowed_stats,
                max_value_size,
            ),
        };
        state.caches.insert(id, Arc::clone(&cache));
        drop(state);

        info!(cache_id = id, ?cache_type, max_size, "Cache created");
        self.events.publish(CacheEvent::CacheCreated {
            cache_id: id,
            cache_type,
            max_size,
            timestamp: Utc::now(),
        });
        Ok(cache)
    }

    /// Shut a cache down and release its memory
    ///
    /// Returns once in-flight tasks for the cache have observed the
    /// shutdown; must not be called while the manager lock is held.
    pub fn destroy_cache(&self, cache: &Arc<dyn Cache>) {
        cache.shutdown();
    }

    /// Remove a shut-down cache from the registry
    pub(crate) fn unregister_cache(&self, id: u64) {
        let removed = {
            let mut state = self.state.write();
            self.access_stats.purge_record(id);
            let removed = state.caches.remove(&id);
            if let Some(cache) = &removed {
                let allocated = cache.metadata().lock().allocated_size;
                state.release_allocation(allocated);
            }
            removed
        };
        if removed.is_some() {
            info!(cache_id = id, "Cache destroyed");
            self.events.publish(CacheEvent::CacheDestroyed {
                cache_id: id,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn cache(&self, id: u64) -> Option<Arc<dyn Cache>> {
        self.state.read().caches.get(&id).cloned()
    }

    pub fn caches(&self) -> Vec<Arc<dyn Cache>> {
        self.state.read().caches.values().cloned().collect()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Refuse new work from now on
    pub fn begin_shutdown(&self) {
        let mut state = self.state.write();
        if !state.shutdown {
            state.shutting_down = true;
            self.shutting_down.store(true, Ordering::Release);
        }
    }

    /// Wait for background tasks, shut every cache down and release spare
    /// tables
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        if state.shutdown {
            return;
        }
        state.shutting_down = true;
        self.shutting_down.store(true, Ordering::Release);

        while state.global_process_running() || self.outstanding_tasks.load(Ordering::Acquire) > 0 {
            state = state.unlocked(|| std::thread::sleep(SHUTDOWN_POLL)).0;
        }

        let caches: Vec<Arc<dyn Cache>> = state.caches.values().cloned().collect();
        for cache in caches {
            state = state.unlocked(|| cache.shutdown()).0;
        }

        let freed = self.free_unused_tables(&mut state);
        state.shutdown = true;
        let global_allocation = state.global_allocation;
        drop(state);
        drop(freed);
        info!(global_allocation, "Cache manager shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.read().shutdown
    }

    // =========================================================================
    // Budget
    // =========================================================================

    /// Change the global limit
    ///
    /// Returns false if the limit is invalid or another global process is
    /// running. Shrinking below the current allocation switches the manager
    /// into resizing mode until the scheduled free-memory tasks finish.
    #[instrument(skip(self))]
    pub fn resize(&self, new_limit: u64) -> bool {
        let mut state = self.state.write();
        let caches = state.caches.len() as u64;
        if new_limit < MANAGER_MIN_SIZE
            || ((0.5 * (1.0 - HIGHWATER_MULTIPLIER) * new_limit as f64) as u64)
                < state.fixed_allocation
            || ((HIGHWATER_MULTIPLIER * new_limit as f64) as u64) < caches * MIN_CACHE_ALLOCATION
        {
            debug!(new_limit, "Resize refused: invalid limit");
            return false;
        }
        if !state.is_operational() || state.global_process_running() {
            debug!(new_limit, "Resize refused: manager busy");
            return false;
        }

        if state.adjust_global_limits_if_allowed(new_limit) {
            info!(new_limit, "Global limit adjusted");
            return true;
        }

        state.resizing = true;
        state.set_soft_limit(new_limit);
        let freed = self.free_unused_tables(&mut state);
        if state.adjust_global_limits_if_allowed(new_limit) {
            state.resizing = false;
        } else {
            self.compute_deserved(&mut state);
            let scheduled = self.shrink_overgrown_caches(&mut state, TaskEnvironment::Resizing);
            info!(new_limit, scheduled, "Global resize scheduled");
            if self.resizing_tasks.load(Ordering::Acquire) == 0 {
                Self::finish_resize(&mut state);
            }
        }
        drop(state);
        drop(freed);
        true
    }

    /// Leave resizing mode, lowering the hard limit if the allocation fits
    fn finish_resize(state: &mut ManagerState) {
        if state.global_allocation <= state.global_soft_limit {
            state.global_hard_limit = state.global_soft_limit;
        } else {
            warn!(
                global_allocation = state.global_allocation,
                soft_limit = state.global_soft_limit,
                "Resize finished above the new limit"
            );
        }
        state.resizing = false;
    }

    /// Recompute every cache's deserved size and shrink overgrown caches
    #[instrument(skip(self))]
    pub fn rebalance(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.is_operational() {
            return Err(Error::ShuttingDown);
        }
        if state.caches.is_empty() {
            return Ok(());
        }
        if state.global_process_running() {
            return Err(Error::TransientBusy(
                "rebalance or resize already running".into(),
            ));
        }

        state.rebalancing = true;
        let caches = state.caches.len();
        self.events.publish(CacheEvent::RebalanceScheduled {
            caches,
            timestamp: Utc::now(),
        });

        self.compute_deserved(&mut state);
        let mut shrink_tasks = 0;
        if state.global_allocation as f64 >= SHRINK_THRESHOLD * state.global_highwater_mark as f64 {
            shrink_tasks = self.shrink_overgrown_caches(&mut state, TaskEnvironment::Rebalancing);
        }
        if self.rebalancing_tasks.load(Ordering::Acquire) == 0 {
            state.rebalancing = false;
            state.rebalance_completed = Some(Instant::now());
        }
        drop(state);

        self.metrics.record_rebalance();
        debug!(caches, shrink_tasks, "Rebalanced");
        self.events.publish(CacheEvent::RebalanceCompleted {
            caches,
            shrink_tasks,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Weight per cache, ascending; weights sum to about 1
    fn priority_list(&self, state: &ManagerState) -> Vec<(Arc<dyn Cache>, f64)> {
        let highwater = state.global_highwater_mark as f64;
        let mut minimum_weight = MIN_CACHE_ALLOCATION as f64 / highwater;
        while (minimum_weight * highwater).ceil() < MIN_CACHE_ALLOCATION as f64 {
            minimum_weight *= 1.001;
        }
        let count = state.caches.len() as f64;
        let base_weight = minimum_weight.max(0.2 / count);
        let remaining_weight = (1.0 - base_weight * count).max(0.0);

        let mut accessed: Vec<(Arc<dyn Cache>, u64)> = Vec::new();
        let mut total_accesses = 0u64;
        for (id, frequency) in self.access_stats.get_frequencies() {
            if let Some(cache) = state.caches.get(&id) {
                total_accesses += frequency;
                accessed.push((Arc::clone(cache), frequency));
            }
        }
        let total_accesses = total_accesses.max(1) as f64;

        let allocation_fraction = 0.8 * (state.global_allocation as f64 / highwater).min(1.0);
        let usages: BTreeMap<u64, u64> = state
            .caches
            .iter()
            .map(|(id, cache)| (*id, cache.usage()))
            .collect();
        let global_usage = usages.values().sum::<u64>().max(1) as f64;
        let access_normalizer = (1.0 - allocation_fraction) * remaining_weight / total_accesses;
        let usage_normalizer = allocation_fraction * remaining_weight / global_usage;

        let usage_of = |id: u64| usages.get(&id).copied().unwrap_or(0) as f64;
        let mut list: Vec<(Arc<dyn Cache>, f64)> = Vec::with_capacity(state.caches.len());
        for (id, cache) in &state.caches {
            if !accessed.iter().any(|(c, _)| c.id() == *id) {
                let weight = base_weight + usage_of(*id) * usage_normalizer;
                list.push((Arc::clone(cache), weight));
            }
        }
        for (cache, frequency) in accessed {
            let weight = base_weight
                + frequency as f64 * access_normalizer
                + usage_of(cache.id()) * usage_normalizer;
            list.push((cache, weight));
        }
        list
    }

    fn compute_deserved(&self, state: &mut ManagerState) {
        let highwater = state.global_highwater_mark as f64;
        for (cache, weight) in self.priority_list(state) {
            let deserved = (weight * highwater).ceil() as u64;
            let granted = cache.metadata().lock().adjust_deserved(deserved);
            debug!(cache_id = cache.id(), weight, granted, "Deserved size");
        }
    }

    /// Schedule shrinking for every cache allocated above its deserved size
    fn shrink_overgrown_caches(&self, state: &mut ManagerState, environment: TaskEnvironment) -> u64 {
        let caches: Vec<Arc<dyn Cache>> = state.caches.values().cloned().collect();
        let mut scheduled = 0;
        for cache in caches {
            if cache.is_shutdown() {
                continue;
            }
            let meta = cache.metadata().lock();
            if meta.is_resizing() || meta.allocated_size <= meta.deserved_size {
                continue;
            }
            let new_limit = meta.new_limit();
            if self.resize_cache(state, environment, meta, &cache, new_limit) {
                scheduled += 1;
            }
        }
        scheduled
    }

    /// Move a cache to `new_limit`; returns whether a task was scheduled
    fn resize_cache(
        &self,
        state: &mut ManagerState,
        environment: TaskEnvironment,
        mut meta: SpinGuard<'_, Metadata>,
        cache: &Arc<dyn Cache>,
        new_limit: u64,
    ) -> bool {
        if meta.usage <= new_limit {
            let before = meta.allocated_size;
            if !meta.adjust_limits(new_limit, new_limit) {
                debug!(cache_id = cache.id(), new_limit, "Limit change refused");
                return false;
            }
            let after = meta.allocated_size;
            drop(meta);
            if after >= before {
                state.add_allocation(after - before);
            } else {
                state.release_allocation(before - after);
            }
            return false;
        }

        let hard = meta.hard_usage_limit;
        if !meta.adjust_limits(new_limit, hard) {
            debug!(cache_id = cache.id(), new_limit, "Soft limit change refused");
            return false;
        }
        meta.toggle_resizing();
        drop(meta);

        let dispatched = !cache.is_shutdown()
            && self.arc().is_some_and(|manager| {
                FreeMemoryTask::new(environment, manager, Arc::clone(cache), new_limit)
                    .dispatch(state)
            });
        if !dispatched {
            cache.metadata().lock().toggle_resizing();
        }
        dispatched
    }

    /// Hand a cache a new table; the metadata lock is released before
    /// dispatch
    fn migrate_cache(
        &self,
        state: &mut ManagerState,
        environment: TaskEnvironment,
        mut meta: SpinGuard<'_, Metadata>,
        cache: &Arc<dyn Cache>,
        table: Arc<Table>,
    ) -> Option<Arc<Table>> {
        debug_assert!(!meta.is_migrating());
        meta.toggle_migrating();
        drop(meta);

        let dispatched = !cache.is_shutdown()
            && self.arc().is_some_and(|manager| {
                MigrateTask::new(environment, manager, Arc::clone(cache), Arc::clone(&table))
                    .dispatch(state)
            });
        if dispatched {
            return None;
        }
        cache.metadata().lock().toggle_migrating();
        self.reclaim_table_locked(state, table)
    }

    // =========================================================================
    // Cache Requests
    // =========================================================================

    /// Ask for a larger usage limit; returns whether it was granted and
    /// when the cache may ask again
    pub(crate) fn request_grow(&self, cache: &Arc<dyn Cache>) -> (bool, Instant) {
        let mut next_request = Instant::now() + REQUEST_BACKOFF;
        let mut allowed = false;

        if let Some(mut state) = self.state.try_write_for(TRIES_SLOW) {
            if state.is_operational() && !state.global_process_running() && !cache.is_shutdown() {
                let mut meta = cache.metadata().lock();
                allowed = !meta.is_resizing() && !meta.is_migrating();
                if allowed && meta.allocated_size >= meta.deserved_size {
                    allowed = false;
                    if self.past_grace_period(&state) {
                        let increase = (meta.hard_usage_limit / 2)
                            .min(meta.max_size.saturating_sub(meta.allocated_size));
                        if increase > 0 && state.increase_allowed(increase, false) {
                            let target = meta.allocated_size + increase;
                            meta.adjust_deserved(target);
                            allowed = true;
                        }
                    }
                }
                if allowed {
                    next_request = Instant::now();
                    let new_limit = meta.new_limit();
                    self.resize_cache(&mut state, TaskEnvironment::None, meta, cache, new_limit);
                }
            }
        }

        self.metrics.record_grow_request(allowed);
        if !allowed {
            debug!(cache_id = cache.id(), "Grow request refused");
        }
        (allowed, next_request)
    }

    /// Ask for a table of `2^log_size` buckets
    pub(crate) fn request_migrate(&self, cache: &Arc<dyn Cache>, log_size: u32) -> (bool, Instant) {
        let mut next_request = Instant::now() + REQUEST_BACKOFF;
        let mut allowed = false;
        let mut leftover = None;

        if (MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size) {
            if let Some(mut state) = self.state.try_write_for(TRIES_SLOW) {
                if state.is_operational() && !state.global_process_running() && !cache.is_shutdown()
                {
                    let mut meta = cache.metadata().lock();
                    allowed = !meta.is_migrating();

                    let new_table_size = Table::allocation_size(log_size);
                    if allowed && meta.table_size < new_table_size {
                        let increase = new_table_size - meta.table_size;
                        if meta.allocated_size + increase >= meta.deserved_size
                            && self.past_grace_period(&state)
                        {
                            if state.increase_allowed(increase, false) {
                                let target = meta.allocated_size + increase;
                                let granted = meta.adjust_deserved(target);
                                allowed = granted >= target;
                            } else {
                                allowed = false;
                            }
                        }
                    }
                    allowed = allowed && meta.migration_allowed(new_table_size);

                    if allowed {
                        match self.lease_table(&mut state, log_size) {
                            Some(table) => {
                                next_request = Instant::now();
                                leftover = self.migrate_cache(
                                    &mut state,
                                    TaskEnvironment::None,
                                    meta,
                                    cache,
                                    table,
                                );
                            }
                            None => allowed = false,
                        }
                    }
                }
            }
        }
        drop(leftover);

        self.metrics.record_migrate_request(allowed);
        if !allowed {
            debug!(cache_id = cache.id(), log_size, "Migrate request refused");
        }
        (allowed, next_request)
    }

    /// Note an access to cache `id` (sampled one in eight)
    pub fn report_access(&self, id: u64) {
        if rand::random::<u32>() & 7 == 0 {
            self.access_stats.insert_record(id);
        }
    }

    pub fn report_hit_stat(&self, stat: Stat) {
        match stat {
            Stat::FindHit => self.find_hits.fetch_add(1, Ordering::Relaxed),
            Stat::FindMiss => self.find_misses.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(buffer) = &self.find_stats {
            buffer.insert_record(stat.as_u64());
        }
    }

    /// Lifetime and windowed hit rate across all caches, in percent
    pub fn global_hit_rates(&self) -> (f64, f64) {
        hit_rates_from(
            self.find_hits.load(Ordering::Relaxed),
            self.find_misses.load(Ordering::Relaxed),
            self.find_stats.as_ref(),
        )
    }

    // =========================================================================
    // Table Pool
    // =========================================================================

    /// Take a pooled table or allocate a new one within the budget
    fn lease_table(&self, state: &mut ManagerState, log_size: u32) -> Option<Arc<Table>> {
        if let Some(table) = state.tables[log_size as usize].pop() {
            state.spare_table_allocation -= table.memory_usage();
            state.spare_tables -= 1;
            state.active_tables += 1;
            return Some(table);
        }
        let size = Table::allocation_size(log_size);
        if !state.increase_allowed(size, true) {
            return None;
        }
        let table = Arc::new(Table::new(log_size));
        state.add_allocation(size);
        state.active_tables += 1;
        Some(table)
    }

    /// Return a table that is no longer active
    pub(crate) fn reclaim_table(&self, table: Arc<Table>) {
        if Arc::strong_count(&table) == 1 {
            table.clear();
        }
        let leftover = {
            let mut state = self.state.write();
            self.reclaim_table_locked(&mut state, table)
        };
        drop(leftover);
    }

    /// Pool or release `table`; returns it when it should be freed outside
    /// the lock
    fn reclaim_table_locked(&self, state: &mut ManagerState, table: Arc<Table>) -> Option<Arc<Table>> {
        state.active_tables = state.active_tables.saturating_sub(1);
        let memory = table.memory_usage();
        let log_size = table.log_size() as usize;
        let spare_room =
            state.global_soft_limit.saturating_sub(state.global_highwater_mark) / 2;

        let keep = Arc::strong_count(&table) == 1
            && state.tables[log_size].len() < max_pooled_tables(table.log_size())
            && memory <= MAX_POOLED_TABLE_SIZE
            && state.spare_tables < MAX_SPARE_TABLES_TOTAL
            && memory + state.spare_table_allocation < spare_room;
        if keep {
            table.clear();
            state.tables[log_size].push(table);
            state.spare_table_allocation += memory;
            state.spare_tables += 1;
            None
        } else {
            state.release_allocation(memory);
            Some(table)
        }
    }

    /// Drop every pooled table
    fn free_unused_tables(&self, state: &mut ManagerState) -> Vec<Arc<Table>> {
        let freed: Vec<Arc<Table>> = state.tables.iter_mut().flat_map(std::mem::take).collect();
        let memory: u64 = freed.iter().map(|t| t.memory_usage()).sum();
        state.release_allocation(memory);
        state.spare_table_allocation = 0;
        state.spare_tables = 0;
        freed
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub(crate) fn prepare_task(&self, environment: TaskEnvironment) {
        self.outstanding_tasks.fetch_add(1, Ordering::AcqRel);
        match environment {
            TaskEnvironment::Rebalancing => {
                self.rebalancing_tasks.fetch_add(1, Ordering::AcqRel);
            }
            TaskEnvironment::Resizing => {
                self.resizing_tasks.fetch_add(1, Ordering::AcqRel);
            }
            TaskEnvironment::None => {}
        }
    }

    /// Count a task down; takes the manager lock when a global process ends
    pub(crate) fn unprepare_task(&self, environment: TaskEnvironment) {
        match environment {
            TaskEnvironment::Rebalancing => {
                if self.rebalancing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut state = self.state.write();
                    state.rebalancing = false;
                    state.rebalance_completed = Some(Instant::now());
                }
            }
            TaskEnvironment::Resizing => {
                if self.resizing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    Self::finish_resize(&mut self.state.write());
                }
            }
            TaskEnvironment::None => {}
        }
        self.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count a task down while the manager lock is already held
    pub(crate) fn unprepare_task_locked(&self, state: &mut ManagerState, environment: TaskEnvironment) {
        match environment {
            TaskEnvironment::Rebalancing => {
                if self.rebalancing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    state.rebalancing = false;
                    state.rebalance_completed = Some(Instant::now());
                }
            }
            TaskEnvironment::Resizing => {
                if self.resizing_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                    Self::finish_resize(state);
                }
            }
            TaskEnvironment::None => {}
        }
        self.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Settle a finished free-memory run: drop the hard limit to the soft
    /// limit and return the difference to the budget
    pub(crate) fn complete_free_memory(&self, cache: &Arc<dyn Cache>) -> u64 {
        let mut state = self.state.write();
        let mut meta = cache.metadata().lock();
        let soft = meta.soft_usage_limit;
        let reclaimed = meta.hard_usage_limit - soft;
        let ok = meta.adjust_limits(soft, soft);
        meta.toggle_resizing();
        drop(meta);
        if ok {
            state.release_allocation(reclaimed);
            reclaimed
        } else {
            0
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin_transaction(&self, read_only: bool) -> Transaction {
        self.transactions.begin(read_only)
    }

    pub fn end_transaction(&self, tx: Transaction) {
        self.transactions.end(tx)
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Current limit: the soft limit while resizing, the hard limit otherwise
    pub fn global_limit(&self) -> u64 {
        self.state.read().global_limit()
    }

    pub fn global_allocation(&self) -> u64 {
        self.state.read().global_allocation
    }

    pub fn spare_allocation(&self) -> u64 {
        self.state.read().spare_table_allocation
    }

    pub fn fixed_allocation(&self) -> u64 {
        self.state.read().fixed_allocation
    }

    pub fn global_highwater_mark(&self) -> u64 {
        self.state.read().global_highwater_mark
    }

    pub fn is_resizing(&self) -> bool {
        self.state.read().resizing
    }

    pub fn is_rebalancing(&self) -> bool {
        self.state.read().rebalancing
    }

    pub fn outstanding_tasks(&self) -> u64 {
        self.outstanding_tasks.load(Ordering::Acquire)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let state = self.state.read();
        MemoryStats {
            global_limit: state.global_limit(),
            global_allocation: state.global_allocation,
            global_highwater_mark: state.global_highwater_mark,
            fixed_allocation: state.fixed_allocation,
            spare_allocation: state.spare_table_allocation,
            active_tables: state.active_tables,
            spare_tables: state.spare_tables,
            caches: state.caches.len() as u64,
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("stats", &self.memory_stats())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
