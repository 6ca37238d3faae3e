//! Hash-table buckets
//!
//! A bucket is a small fixed array of slots guarded by one spin lock. It
//! also carries the migration bit and a ring of blacklist markers.
//!
//! # Freshness
//!
//! Each slot has an 8-bit freshness score. Installing a record sets it to
//! [`INSERT_FRESHNESS`], a hit adds [`HIT_BONUS`], and every touch of a slot
//! decays all other occupied slots in the bucket by one. The coldest slot
//! (lowest score, ties broken by lowest index) is evicted first, so records
//! that are never read leave oldest first.

use std::sync::Arc;

use super::hasher::KeyHasher;
use super::value::CachedValue;

/// Slots per bucket
pub const SLOTS_PER_BUCKET: usize = 8;

/// Blacklist markers per bucket
pub const BLACKLIST_SLOTS: usize = 4;

/// Freshness assigned on insert
pub const INSERT_FRESHNESS: u8 = 128;

/// Freshness added on a hit
pub const HIT_BONUS: u8 = 16;

/// What to do when a bucket's blacklist ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOverflow {
    /// Drop the oldest marker
    EvictOldest,
    /// Treat every hash in the bucket as blacklisted until the term advances
    Saturate,
}

/// A hash forbidden from re-entry, valid from `term` on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistMarker {
    pub hash: u64,
    pub term: u64,
}

/// One hash-table entry
#[derive(Debug, Default)]
pub struct Slot {
    hash: u64,
    record: Option<Arc<CachedValue>>,
    freshness: u8,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn record(&self) -> Option<&Arc<CachedValue>> {
        self.record.as_ref()
    }

    pub fn freshness(&self) -> u8 {
        self.freshness
    }

    fn size(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.size())
    }
}

/// Lock-protected contents of a bucket
#[derive(Debug, Default)]
pub struct BucketState {
    slots: [Slot; SLOTS_PER_BUCKET],
    markers: [Option<BlacklistMarker>; BLACKLIST_SLOTS],
    /// Ring position of the next marker to overwrite
    next_marker: usize,
    saturated: bool,
    /// Last committed term this bucket has caught up with
    term: u64,
    migrated: bool,
}

impl BucketState {
    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    pub fn slots(&self) -> &[Slot; SLOTS_PER_BUCKET] {
        &self.slots
    }

    pub fn slot_size(&self, index: usize) -> u64 {
        self.slots[index].size()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    /// Index of the slot holding `key`
    pub fn find_slot<H: KeyHasher>(&self, hash: u64, key: &[u8]) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.hash == hash
                && slot
                    .record
                    .as_ref()
                    .is_some_and(|record| H::same_key(record.key(), key))
        })
    }

    pub fn empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_empty)
    }

    /// Coldest occupied slot not listed in `exclude`
    pub fn coldest_excluding(&self, exclude: &[Option<usize>]) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_empty() || exclude.contains(&Some(index)) {
                continue;
            }
            match best {
                Some((_, freshness)) if freshness <= slot.freshness => {}
                _ => best = Some((index, slot.freshness)),
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn coldest(&self) -> Option<usize> {
        self.coldest_excluding(&[])
    }

    /// Mean freshness over occupied slots
    pub fn average_freshness(&self) -> Option<f64> {
        let (count, total) = self
            .slots
            .iter()
            .filter(|s| !s.is_empty())
            .fold((0u32, 0u32), |(n, t), s| (n + 1, t + s.freshness as u32));
        (count > 0).then(|| total as f64 / count as f64)
    }

    fn decay_except(&mut self, index: usize) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i != index && !slot.is_empty() {
                slot.freshness = slot.freshness.saturating_sub(1);
            }
        }
    }

    /// Register a hit on `index`
    pub fn touch(&mut self, index: usize) {
        self.decay_except(index);
        let slot = &mut self.slots[index];
        slot.freshness = slot.freshness.saturating_add(HIT_BONUS);
    }

    /// Look up `key`, bumping its freshness on a hit
    pub fn lookup<H: KeyHasher>(&mut self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        let index = self.find_slot::<H>(hash, key)?;
        self.touch(index);
        self.slots[index].record.clone()
    }

    /// Put `record` into slot `index`, returning what was there
    pub fn install(
        &mut self,
        index: usize,
        hash: u64,
        record: Arc<CachedValue>,
    ) -> Option<Arc<CachedValue>> {
        self.install_with_freshness(index, hash, record, INSERT_FRESHNESS)
    }

    pub(crate) fn install_with_freshness(
        &mut self,
        index: usize,
        hash: u64,
        record: Arc<CachedValue>,
        freshness: u8,
    ) -> Option<Arc<CachedValue>> {
        self.decay_except(index);
        let slot = &mut self.slots[index];
        slot.hash = hash;
        slot.freshness = freshness;
        slot.record.replace(record)
    }

    /// Empty slot `index`, returning its record
    pub fn take(&mut self, index: usize) -> Option<Arc<CachedValue>> {
        let slot = &mut self.slots[index];
        slot.hash = 0;
        slot.freshness = 0;
        slot.record.take()
    }

    pub fn remove<H: KeyHasher>(&mut self, hash: u64, key: &[u8]) -> Option<Arc<CachedValue>> {
        let index = self.find_slot::<H>(hash, key)?;
        self.take(index)
    }

    /// Remove every record whose hash equals `hash`
    pub fn remove_hash(&mut self, hash: u64) -> Vec<Arc<CachedValue>> {
        let mut removed = Vec::new();
        for index in 0..SLOTS_PER_BUCKET {
            if self.slots[index].hash == hash && !self.slots[index].is_empty() {
                removed.extend(self.take(index));
            }
        }
        removed
    }

    /// Move every record out, with hash and freshness
    pub fn drain(&mut self) -> Vec<(u64, Arc<CachedValue>, u8)> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(record) = slot.record.take() {
                out.push((slot.hash, record, slot.freshness));
                slot.hash = 0;
                slot.freshness = 0;
            }
        }
        out
    }

    // -------------------------------------------------------------------------
    // Blacklist
    // -------------------------------------------------------------------------

    pub fn is_blacklisted(&self, hash: u64) -> bool {
        self.saturated || self.markers.iter().flatten().any(|m| m.hash == hash)
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn markers(&self) -> impl Iterator<Item = &BlacklistMarker> {
        self.markers.iter().flatten()
    }

    /// Install a marker for `hash`; an existing marker keeps the newer term
    pub fn add_marker(&mut self, hash: u64, term: u64, overflow: MarkerOverflow) {
        if let Some(existing) = self.markers.iter_mut().flatten().find(|m| m.hash == hash) {
            existing.term = existing.term.max(term);
            return;
        }
        if let Some(free) = self.markers.iter_mut().find(|m| m.is_none()) {
            *free = Some(BlacklistMarker { hash, term });
            return;
        }
        match overflow {
            MarkerOverflow::EvictOldest => {
                self.markers[self.next_marker] = Some(BlacklistMarker { hash, term });
                self.next_marker = (self.next_marker + 1) % BLACKLIST_SLOTS;
            }
            MarkerOverflow::Saturate => self.saturated = true,
        }
    }

    /// Remove the marker for `hash`; returns whether one existed
    pub fn clear_marker(&mut self, hash: u64) -> bool {
        let mut cleared = false;
        for marker in self.markers.iter_mut() {
            if marker.is_some_and(|m| m.hash == hash) {
                *marker = None;
                cleared = true;
            }
        }
        cleared
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Catch up with `committed`, dropping markers older than it
    pub fn refresh_term(&mut self, committed: u64) {
        if committed <= self.term {
            return;
        }
        for marker in self.markers.iter_mut() {
            if marker.is_some_and(|m| m.term < committed) {
                *marker = None;
            }
        }
        self.saturated = false;
        self.term = committed;
    }

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------

    pub fn is_migrated(&self) -> bool {
        self.migrated
    }

    pub fn set_migrated(&mut self) {
        self.migrated = true;
    }

    /// Take all markers, leaving the ring empty
    pub fn take_markers(&mut self) -> (Vec<BlacklistMarker>, bool) {
        let markers = self.markers.iter_mut().filter_map(Option::take).collect();
        let saturated = std::mem::take(&mut self.saturated);
        self.next_marker = 0;
        (markers, saturated)
    }

    /// Mark the bucket saturated (carried over by migration)
    pub fn saturate(&mut self) {
        self.saturated = true;
    }

    /// Reset to the freshly allocated state
    pub fn reset(&mut self) {
        *self = BucketState::default();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::hasher::BinaryKeyHasher;

    fn record(key: &str) -> Arc<CachedValue> {
        CachedValue::construct(key.as_bytes(), b"v")
    }

    #[test]
    fn test_install_and_lookup() {
        let mut bucket = BucketState::default();
        bucket.install(0, 11, record("a"));
        assert_eq!(bucket.occupied(), 1);
        let found = bucket.lookup::<BinaryKeyHasher>(11, b"a").unwrap();
        assert_eq!(found.key(), b"a");
        assert!(bucket.lookup::<BinaryKeyHasher>(11, b"b").is_none());
        assert!(bucket.lookup::<BinaryKeyHasher>(12, b"a").is_none());
    }

    #[test]
    fn test_never_read_entries_evict_oldest_first() {
        let mut bucket = BucketState::default();
        for i in 0..SLOTS_PER_BUCKET {
            bucket.install(i, i as u64 + 1, record(&format!("k{i}")));
        }
        assert_eq!(bucket.coldest(), Some(0));
        bucket.lookup::<BinaryKeyHasher>(1, b"k0");
        assert_eq!(bucket.coldest(), Some(1));
    }

    #[test]
    fn test_coldest_ties_break_by_index() {
        let mut bucket = BucketState::default();
        bucket.install_with_freshness(3, 1, record("a"), 10);
        bucket.install_with_freshness(5, 2, record("b"), 9);
        // installing at 5 decayed slot 3 to 9
        assert_eq!(bucket.slots()[3].freshness(), 9);
        assert_eq!(bucket.coldest(), Some(3));
        assert_eq!(bucket.coldest_excluding(&[Some(3)]), Some(5));
    }

    #[test]
    fn test_remove_hash_removes_collisions() {
        let mut bucket = BucketState::default();
        bucket.install(0, 7, record("a"));
        bucket.install(1, 7, record("b"));
        bucket.install(2, 8, record("c"));
        let removed = bucket.remove_hash(7);
        assert_eq!(removed.len(), 2);
        assert_eq!(bucket.occupied(), 1);
    }

    #[test]
    fn test_marker_ring_evicts_oldest() {
        let mut bucket = BucketState::default();
        for hash in 1..=BLACKLIST_SLOTS as u64 {
            bucket.add_marker(hash, 0, MarkerOverflow::EvictOldest);
        }
        bucket.add_marker(99, 0, MarkerOverflow::EvictOldest);
        assert!(!bucket.is_blacklisted(1));
        assert!(bucket.is_blacklisted(2));
        assert!(bucket.is_blacklisted(99));
    }

    #[test]
    fn test_marker_is_idempotent() {
        let mut bucket = BucketState::default();
        bucket.add_marker(5, 1, MarkerOverflow::EvictOldest);
        bucket.add_marker(5, 3, MarkerOverflow::EvictOldest);
        assert_eq!(bucket.markers().count(), 1);
        assert_eq!(bucket.markers().next().unwrap().term, 3);
        assert!(bucket.clear_marker(5));
        assert!(!bucket.is_blacklisted(5));
    }

    #[test]
    fn test_saturation_cleared_by_term_advance() {
        let mut bucket = BucketState::default();
        for hash in 1..=BLACKLIST_SLOTS as u64 + 1 {
            bucket.add_marker(hash, 1, MarkerOverflow::Saturate);
        }
        assert!(bucket.is_saturated());
        assert!(bucket.is_blacklisted(12345));
        bucket.refresh_term(2);
        assert!(!bucket.is_saturated());
        assert!(!bucket.is_blacklisted(1));
        assert_eq!(bucket.term(), 2);
    }

    #[test]
    fn test_refresh_keeps_current_markers() {
        let mut bucket = BucketState::default();
        bucket.add_marker(1, 1, MarkerOverflow::Saturate);
        bucket.add_marker(2, 3, MarkerOverflow::Saturate);
        bucket.refresh_term(2);
        assert!(!bucket.is_blacklisted(1));
        assert!(bucket.is_blacklisted(2));
    }

    #[test]
    fn test_average_freshness() {
        let mut bucket = BucketState::default();
        assert!(bucket.average_freshness().is_none());
        bucket.install_with_freshness(0, 1, record("a"), 10);
        bucket.install_with_freshness(1, 2, record("b"), 20);
        // slot 0 decayed to 9
        assert_eq!(bucket.average_freshness(), Some(14.5));
    }
}
