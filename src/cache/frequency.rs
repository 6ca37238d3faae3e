//! Frequency Buffer
//!
//! Lossy, sampled counter stream. Each `insert_record` overwrites one
//! pseudo-randomly chosen slot of a fixed ring, so values inserted often
//! survive in proportion to their share of recent inserts while rare
//! values are forgotten.
//!
//! # Design
//!
//! - Inserts are a single relaxed 64-bit store; no lock on the hot path
//! - `0` is the empty sentinel and is never counted
//! - Tallying and purging serialize on a mutex so concurrent tallies see a
//!   consistent scan order

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Empty slot marker
const EMPTY: u64 = 0;

/// Frequency Buffer over 64-bit values
pub struct FrequencyBuffer {
    slots: Box<[AtomicU64]>,
    /// `capacity - 1`
    mask: u64,
    /// Serializes full scans
    scan_lock: Mutex<()>,
}

impl FrequencyBuffer {
    /// Create a buffer with at least `capacity` slots (rounded up to a
    /// power of two, minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect();
        Self {
            slots,
            mask: (capacity - 1) as u64,
            scan_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate heap + inline footprint in bytes
    pub fn memory_usage(&self) -> u64 {
        Self::memory_for(self.slots.len())
    }

    /// Footprint of a buffer created with `capacity`
    pub const fn memory_for(capacity: usize) -> u64 {
        let slots = if capacity == 0 {
            1
        } else {
            capacity.next_power_of_two()
        };
        (std::mem::size_of::<Self>() + slots * std::mem::size_of::<AtomicU64>()) as u64
    }

    /// Record one occurrence of `value`
    #[inline]
    pub fn insert_record(&self, value: u64) {
        if value == EMPTY {
            return;
        }
        let index = (rand::random::<u64>() & self.mask) as usize;
        self.slots[index].store(value, Ordering::Relaxed);
    }

    /// Remove every occurrence of `value`
    pub fn purge_record(&self, value: u64) {
        let _scan = self.scan_lock.lock();
        for slot in self.slots.iter() {
            let _ = slot.compare_exchange(value, EMPTY, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Tally the ring into `(value, count)` pairs sorted by ascending count
    /// (ties by ascending value)
    pub fn get_frequencies(&self) -> Vec<(u64, u64)> {
        let mut counts: HashMap<u64, u64> = HashMap::new();
        {
            let _scan = self.scan_lock.lock();
            for slot in self.slots.iter() {
                let value = slot.load(Ordering::Relaxed);
                if value != EMPTY {
                    *counts.entry(value).or_insert(0) += 1;
                }
            }
        }

        let mut frequencies: Vec<(u64, u64)> = counts.into_iter().collect();
        frequencies.sort_unstable_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        frequencies
    }

    /// Reset every slot to empty
    pub fn clear(&self) {
        let _scan = self.scan_lock.lock();
        for slot in self.slots.iter() {
            slot.store(EMPTY, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for FrequencyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrequencyBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
