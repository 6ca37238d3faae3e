//! Per-cache memory accounting
//!
//! Every cache owns one `Metadata` block behind a spin lock. It records what
//! the cache is allowed to use (`deserved_size`, granted by the manager),
//! what it currently reserves (`allocated_size`), and the usage limits that
//! inserts are checked against.
//!
//! ```text
//! allocated_size = hard_usage_limit + fixed_size + table_size + record overhead
//! usage <= hard_usage_limit <= allocated_size
//! ```

use serde::Serialize;

use super::manager::{CACHE_RECORD_OVERHEAD, MIN_CACHE_ALLOCATION};
use super::MIN_SIZE;

/// Memory limits, usage and state flags of one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Bookkeeping overhead of the cache object itself
    pub fixed_size: u64,
    /// Memory of the active table
    pub table_size: u64,
    /// Upper bound the cache may ever allocate
    pub max_size: u64,
    /// Memory currently charged to the global budget
    pub allocated_size: u64,
    /// Budget granted by the manager
    pub deserved_size: u64,
    /// Bytes held by records
    pub usage: u64,
    pub soft_usage_limit: u64,
    pub hard_usage_limit: u64,
    migrating: bool,
    resizing: bool,
}

impl Metadata {
    pub fn new(usage_limit: u64, fixed_size: u64, table_size: u64, max_size: u64) -> Self {
        let allocated_size = usage_limit + fixed_size + table_size + CACHE_RECORD_OVERHEAD;
        Self {
            fixed_size,
            table_size,
            max_size,
            allocated_size,
            deserved_size: allocated_size,
            usage: 0,
            soft_usage_limit: usage_limit,
            hard_usage_limit: usage_limit,
            migrating: false,
            resizing: false,
        }
    }

    /// Everything allocated besides the usage limit
    pub fn fixed_costs(&self) -> u64 {
        self.fixed_size + self.table_size + CACHE_RECORD_OVERHEAD
    }

    /// Reserve (positive) or release (negative) usage
    ///
    /// Releases always succeed. A reservation must stay within the soft
    /// limit, or within the hard limit while no resize is shrinking the cache.
    pub fn adjust_usage_if_allowed(&mut self, delta: i64) -> bool {
        if delta <= 0 {
            self.usage = self.usage.saturating_sub(delta.unsigned_abs());
            return true;
        }
        let new_usage = self.usage.saturating_add(delta as u64);
        if new_usage <= self.soft_usage_limit
            || (!self.resizing && new_usage <= self.hard_usage_limit)
        {
            self.usage = new_usage;
            true
        } else {
            false
        }
    }

    /// Set the deserved size, clamped to `[MIN_CACHE_ALLOCATION, max_size]`
    pub fn adjust_deserved(&mut self, deserved: u64) -> u64 {
        self.deserved_size = deserved.max(MIN_CACHE_ALLOCATION).min(self.max_size);
        self.deserved_size
    }

    /// Usage limit the cache should move to under its deserved size
    pub fn new_limit(&self) -> u64 {
        let fixed = self.fixed_costs();
        if MIN_SIZE + fixed >= self.deserved_size {
            MIN_SIZE
        } else {
            (self.deserved_size - fixed).min(4 * self.hard_usage_limit)
        }
    }

    /// Whether a table of `table_size` bytes fits the deserved size
    pub fn migration_allowed(&self, table_size: u64) -> bool {
        self.hard_usage_limit + self.fixed_size + table_size + CACHE_RECORD_OVERHEAD
            <= self.deserved_size.min(self.max_size)
    }

    /// Change the usage limits; returns whether the change was accepted
    pub fn adjust_limits(&mut self, soft: u64, hard: u64) -> bool {
        let fixed = self.fixed_costs();
        let ceiling = self.deserved_size.min(self.max_size);

        let approved =
            // begin shrinking to the minimum; the table may exceed deserved
            (soft == MIN_SIZE && hard == self.hard_usage_limit)
            // finish shrinking to the minimum
            || (soft == MIN_SIZE && hard == MIN_SIZE && self.usage <= hard)
            // begin shrinking
            || (hard == self.hard_usage_limit && soft < hard && soft + fixed <= ceiling)
            // finish shrinking
            || (soft == self.soft_usage_limit && soft == hard && self.usage <= hard)
            // move both limits within deserved
            || (soft == hard && self.usage <= hard && hard + fixed <= ceiling);

        if approved {
            self.soft_usage_limit = soft;
            self.hard_usage_limit = hard;
            self.allocated_size = hard + fixed;
        }
        approved
    }

    /// Account for a new active table (0 when the cache releases its table)
    pub fn change_table(&mut self, table_size: u64) {
        self.table_size = table_size;
        self.allocated_size = self.hard_usage_limit + self.fixed_costs();
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating
    }

    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    pub fn toggle_migrating(&mut self) {
        self.migrating = !self.migrating;
    }

    pub fn toggle_resizing(&mut self) {
        self.resizing = !self.resizing;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::table::{Table, MIN_LOG_SIZE};

    fn metadata() -> Metadata {
        let table = Table::allocation_size(MIN_LOG_SIZE);
        Metadata::new(MIN_SIZE, 512, table, 64 * 1024 * 1024)
    }

    #[test]
    fn test_new_metadata_invariants() {
        let meta = metadata();
        assert_eq!(meta.soft_usage_limit, MIN_SIZE);
        assert_eq!(meta.hard_usage_limit, MIN_SIZE);
        assert_eq!(meta.allocated_size, MIN_SIZE + meta.fixed_costs());
        assert_eq!(meta.deserved_size, meta.allocated_size);
        assert!(meta.usage <= meta.hard_usage_limit);
        assert!(meta.hard_usage_limit <= meta.allocated_size);
    }

    #[test]
    fn test_usage_reservation() {
        let mut meta = metadata();
        assert!(meta.adjust_usage_if_allowed(MIN_SIZE as i64));
        assert!(!meta.adjust_usage_if_allowed(1));
        assert!(meta.adjust_usage_if_allowed(-100));
        assert_eq!(meta.usage, MIN_SIZE - 100);
        // release never underflows
        assert!(meta.adjust_usage_if_allowed(-(2 * MIN_SIZE as i64)));
        assert_eq!(meta.usage, 0);
    }

    #[test]
    fn test_resizing_restricts_to_soft_limit() {
        let mut meta = metadata();
        meta.adjust_deserved(meta.allocated_size + 4 * MIN_SIZE);
        assert!(meta.adjust_limits(2 * MIN_SIZE, 2 * MIN_SIZE));
        assert!(meta.adjust_usage_if_allowed(MIN_SIZE as i64 + 10));
        assert!(meta.adjust_limits(MIN_SIZE, 2 * MIN_SIZE));
        meta.toggle_resizing();
        assert!(!meta.adjust_usage_if_allowed(1));
        meta.toggle_resizing();
        assert!(meta.adjust_usage_if_allowed(1));
    }

    #[test]
    fn test_adjust_deserved_clamps() {
        let mut meta = metadata();
        assert_eq!(meta.adjust_deserved(1), MIN_CACHE_ALLOCATION);
        assert_eq!(meta.adjust_deserved(u64::MAX), meta.max_size);
    }

    #[test]
    fn test_adjust_limits_rejects_invalid() {
        let mut meta = metadata();
        meta.adjust_deserved(meta.allocated_size + MIN_SIZE);
        // soft above hard
        assert!(!meta.adjust_limits(3 * MIN_SIZE, 2 * MIN_SIZE));
        // beyond deserved
        assert!(!meta.adjust_limits(8 * MIN_SIZE, 8 * MIN_SIZE));
        // hard below usage
        assert!(meta.adjust_usage_if_allowed(MIN_SIZE as i64));
        assert!(!meta.adjust_limits(MIN_SIZE / 2, MIN_SIZE / 2));
        let before = meta.clone();
        assert!(!meta.adjust_limits(MIN_SIZE / 2, MIN_SIZE / 2));
        assert_eq!(meta, before);
    }

    #[test]
    fn test_adjust_limits_updates_allocation() {
        let mut meta = metadata();
        meta.adjust_deserved(meta.allocated_size + 2 * MIN_SIZE);
        assert!(meta.adjust_limits(3 * MIN_SIZE, 3 * MIN_SIZE));
        assert_eq!(meta.allocated_size, 3 * MIN_SIZE + meta.fixed_costs());
    }

    #[test]
    fn test_new_limit() {
        let mut meta = metadata();
        // deserved only covers the minimum
        assert_eq!(meta.new_limit(), MIN_SIZE);
        meta.adjust_deserved(meta.fixed_costs() + 10 * MIN_SIZE);
        // capped at four times the current hard limit
        assert_eq!(meta.new_limit(), 4 * MIN_SIZE);
        meta.adjust_deserved(meta.fixed_costs() + 3 * MIN_SIZE);
        assert_eq!(meta.new_limit(), 3 * MIN_SIZE);
    }

    #[test]
    fn test_migration_allowed_and_change_table() {
        let mut meta = metadata();
        let bigger = Table::allocation_size(MIN_LOG_SIZE + 1);
        assert!(!meta.migration_allowed(bigger));
        meta.adjust_deserved(meta.allocated_size + bigger);
        assert!(meta.migration_allowed(bigger));

        meta.change_table(bigger);
        assert_eq!(meta.table_size, bigger);
        assert_eq!(meta.allocated_size, meta.hard_usage_limit + meta.fixed_costs());
        meta.change_table(0);
        assert_eq!(meta.allocated_size, meta.hard_usage_limit + 512 + CACHE_RECORD_OVERHEAD);
    }

    #[test]
    fn test_flags_are_independent() {
        let mut meta = metadata();
        meta.toggle_migrating();
        meta.toggle_resizing();
        assert!(meta.is_migrating() && meta.is_resizing());
        meta.toggle_migrating();
        assert!(!meta.is_migrating() && meta.is_resizing());
    }
}
