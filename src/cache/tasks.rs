//! Background Tasks
//!
//! Free-memory and migrate work runs on the manager's [`Executor`]. A task
//! is counted from the moment it is dispatched until it has finished
//! running, so shutdown can wait for every task it handed out.
//!
//! Dispatch always happens with the manager lock held; if the executor
//! refuses the job the counters are rolled back through the locked path.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use super::events::CacheEvent;
use super::manager::{Manager, ManagerState};
use super::metrics::TaskKind;
use super::table::Table;
use super::Cache;

/// Which global process a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnvironment {
    /// Requested by a cache
    None,
    /// Scheduled by a rebalance round
    Rebalancing,
    /// Scheduled by a global resize
    Resizing,
}

/// Counts a running task down when dropped
struct Outstanding<'a> {
    manager: &'a Manager,
    environment: TaskEnvironment,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.manager.unprepare_task(self.environment);
    }
}

// =============================================================================
// FreeMemoryTask
// =============================================================================

/// Evicts records until a cache fits its new soft limit
pub(crate) struct FreeMemoryTask {
    environment: TaskEnvironment,
    manager: Arc<Manager>,
    cache: Arc<dyn Cache>,
    new_limit: u64,
}

impl FreeMemoryTask {
    pub fn new(
        environment: TaskEnvironment,
        manager: Arc<Manager>,
        cache: Arc<dyn Cache>,
        new_limit: u64,
    ) -> Self {
        Self {
            environment,
            manager,
            cache,
            new_limit,
        }
    }

    /// Hand the task to the executor; called under the manager lock
    pub fn dispatch(self, state: &mut ManagerState) -> bool {
        let manager = Arc::clone(&self.manager);
        let environment = self.environment;
        let cache_id = self.cache.id();
        let new_limit = self.new_limit;

        manager.prepare_task(environment);
        let accepted = manager.executor().submit(Box::new(move || self.run()));
        manager.metrics().record_dispatch(TaskKind::FreeMemory, accepted);
        if accepted {
            manager.events().publish(CacheEvent::ResizeScheduled {
                cache_id,
                new_limit,
                timestamp: Utc::now(),
            });
        } else {
            warn!(cache_id, "Executor refused free-memory task");
            manager.unprepare_task_locked(state, environment);
        }
        accepted
    }

    fn run(self) {
        let _outstanding = Outstanding {
            manager: &self.manager,
            environment: self.environment,
        };
        debug_assert!(self.cache.metadata().lock().is_resizing());

        let started = Instant::now();
        let ran = self.cache.free_memory();
        let elapsed = started.elapsed();

        let reclaimed = if ran {
            self.manager.complete_free_memory(&self.cache)
        } else {
            self.cache.metadata().lock().toggle_resizing();
            0
        };

        self.manager
            .metrics()
            .record_task_completion(TaskKind::FreeMemory, ran, elapsed);
        debug!(
            cache_id = self.cache.id(),
            reclaimed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Free-memory task finished"
        );
        self.manager.events().publish(CacheEvent::ResizeCompleted {
            cache_id: self.cache.id(),
            reclaimed,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

// =============================================================================
// MigrateTask
// =============================================================================

/// Moves a cache into a freshly leased table
pub(crate) struct MigrateTask {
    environment: TaskEnvironment,
    manager: Arc<Manager>,
    cache: Arc<dyn Cache>,
    table: Arc<Table>,
}

impl MigrateTask {
    pub fn new(
        environment: TaskEnvironment,
        manager: Arc<Manager>,
        cache: Arc<dyn Cache>,
        table: Arc<Table>,
    ) -> Self {
        Self {
            environment,
            manager,
            cache,
            table,
        }
    }

    /// Hand the task to the executor; called under the manager lock
    ///
    /// On refusal the job (and its table reference) has been dropped; the
    /// caller reclaims the table.
    pub fn dispatch(self, state: &mut ManagerState) -> bool {
        let manager = Arc::clone(&self.manager);
        let environment = self.environment;
        let cache_id = self.cache.id();
        let log_size = self.table.log_size();

        manager.prepare_task(environment);
        let accepted = manager.executor().submit(Box::new(move || self.run()));
        manager.metrics().record_dispatch(TaskKind::Migrate, accepted);
        if accepted {
            manager.events().publish(CacheEvent::MigrateScheduled {
                cache_id,
                log_size,
                timestamp: Utc::now(),
            });
        } else {
            warn!(cache_id, log_size, "Executor refused migrate task");
            manager.unprepare_task_locked(state, environment);
        }
        accepted
    }

    fn run(self) {
        let Self {
            environment,
            manager,
            cache,
            table,
        } = self;
        let _outstanding = Outstanding {
            manager: &manager,
            environment,
        };
        debug_assert!(cache.metadata().lock().is_migrating());

        let log_size = table.log_size();
        let started = Instant::now();
        let ran = cache.migrate(Arc::clone(&table));
        let elapsed = started.elapsed();
        if !ran {
            manager.reclaim_table(table);
        }

        manager
            .metrics()
            .record_task_completion(TaskKind::Migrate, ran, elapsed);
        debug!(
            cache_id = cache.id(),
            log_size,
            success = ran,
            elapsed_ms = elapsed.as_millis() as u64,
            "Migrate task finished"
        );
        manager.events().publish(CacheEvent::MigrateCompleted {
            cache_id: cache.id(),
            log_size,
            success: ran,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}
