//! Plain Cache
//!
//! Blacklist markers carry no term. A full marker ring forgets its oldest
//! marker, so a plain cache only guarantees that the most recent
//! [`BLACKLIST_SLOTS`](super::BLACKLIST_SLOTS) blacklisted hashes of a
//! bucket stay blocked.

use super::bucket::MarkerOverflow;
use super::core::{BlacklistPolicy, CacheCore};
use super::table::BucketGuard;
use super::CacheType;

/// Term-free blacklisting
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPolicy;

impl BlacklistPolicy for PlainPolicy {
    const CACHE_TYPE: CacheType = CacheType::Plain;

    fn marker_term(&self) -> u64 {
        0
    }

    fn refresh(&self, _bucket: &mut BucketGuard<'_>) {}

    fn overflow(&self) -> MarkerOverflow {
        MarkerOverflow::EvictOldest
    }
}

/// Cache without transaction awareness
pub type PlainCache<H> = CacheCore<H, PlainPolicy>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BinaryKeyHasher, Cache, InsertOutcome, RejectReason, BLACKLIST_SLOTS};
    use crate::cache::{Manager, ManualExecutor};
    use crate::config::ManagerConfig;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn manager() -> Arc<Manager> {
        let config = ManagerConfig {
            global_limit: 16 * 1024 * 1024,
            ..Default::default()
        };
        Manager::new(config, Arc::new(ManualExecutor::new())).unwrap()
    }

    fn plain_cache(manager: &Arc<Manager>) -> Arc<dyn Cache> {
        manager
            .create_cache::<BinaryKeyHasher>(CacheType::Plain, 4 * 1024 * 1024, false)
            .unwrap()
    }

    #[test]
    fn test_insert_find_replace() {
        let manager = manager();
        let cache = plain_cache(&manager);
        assert_eq!(cache.cache_type(), CacheType::Plain);

        assert_eq!(cache.insert(b"k", b"one"), InsertOutcome::Inserted);
        assert_eq!(cache.find(b"k").unwrap().value(), b"one");
        assert_eq!(cache.insert(b"k", b"two"), InsertOutcome::Replaced);
        assert_eq!(cache.find(b"k").unwrap().value(), b"two");
        assert!(cache.find(b"missing").is_none());
    }

    #[test]
    fn test_usage_tracks_records() {
        let manager = manager();
        let cache = plain_cache(&manager);
        cache.insert(b"key", b"value");
        let size = crate::cache::CachedValue::size_for(b"key", b"value");
        assert_eq!(cache.usage(), size);
        assert!(cache.remove(b"key"));
        assert_eq!(cache.usage(), 0);
        assert!(!cache.remove(b"key"));
    }

    #[test]
    fn test_blacklist_blocks_until_removed() {
        let manager = manager();
        let cache = plain_cache(&manager);
        cache.insert(b"k", b"v");
        cache.blacklist(b"k");
        assert!(cache.find(b"k").is_none());
        assert_eq!(cache.usage(), 0);
        assert_matches!(
            cache.insert(b"k", b"v"),
            InsertOutcome::Rejected(RejectReason::Blacklisted)
        );
        // remove clears the marker
        assert!(!cache.remove(b"k"));
        assert_eq!(cache.insert(b"k", b"v"), InsertOutcome::Inserted);
    }

    /// Sends every key to bucket 0 with a distinct hash
    struct SameBucketHasher;

    impl crate::cache::KeyHasher for SameBucketHasher {
        const NAME: &'static str = "same-bucket";

        fn hash_key(key: &[u8]) -> u64 {
            key.iter()
                .fold(7u64, |h, b| h.wrapping_mul(31).wrapping_add(*b as u64))
                & 0xffff
        }
    }

    #[test]
    fn test_marker_ring_forgets_oldest() {
        let manager = manager();
        let cache = manager
            .create_cache::<SameBucketHasher>(CacheType::Plain, 4 * 1024 * 1024, false)
            .unwrap();
        let keys: Vec<String> = (0..=BLACKLIST_SLOTS).map(|i| format!("k{i}")).collect();
        for key in &keys {
            cache.blacklist(key.as_bytes());
        }
        // the first marker was pushed out of the ring
        assert_eq!(cache.insert(keys[0].as_bytes(), b"v"), InsertOutcome::Inserted);
        assert_matches!(
            cache.insert(keys[BLACKLIST_SLOTS].as_bytes(), b"v"),
            InsertOutcome::Rejected(RejectReason::Blacklisted)
        );
    }

    #[test]
    fn test_value_too_large() {
        let config = ManagerConfig {
            global_limit: 16 * 1024 * 1024,
            max_value_size: 8,
            ..Default::default()
        };
        let manager = Manager::new(config, Arc::new(ManualExecutor::new())).unwrap();
        let cache = plain_cache(&manager);
        assert_matches!(
            cache.insert(b"k", b"0123456789"),
            InsertOutcome::Rejected(RejectReason::ValueTooLarge)
        );
        assert_eq!(cache.insert(b"k", b"01234567"), InsertOutcome::Inserted);
    }

    #[test]
    fn test_shut_down_cache_is_disabled() {
        let manager = manager();
        let cache = plain_cache(&manager);
        cache.insert(b"k", b"v");
        manager.destroy_cache(&cache);
        assert!(cache.is_shutdown());
        assert!(cache.find(b"k").is_none());
        assert_matches!(
            cache.insert(b"k", b"v"),
            InsertOutcome::Rejected(RejectReason::Disabled)
        );
        assert!(!cache.remove(b"k"));
    }

    #[test]
    fn test_hit_rates() {
        let manager = manager();
        let cache = manager
            .create_cache::<BinaryKeyHasher>(CacheType::Plain, 4 * 1024 * 1024, true)
            .unwrap();
        let (lifetime, windowed) = cache.hit_rates();
        assert!(lifetime.is_nan() && windowed.is_nan());

        cache.insert(b"k", b"v");
        cache.find(b"k");
        cache.find(b"k");
        cache.find(b"k");
        cache.find(b"nope");
        let (lifetime, windowed) = cache.hit_rates();
        assert_eq!(lifetime, 75.0);
        assert!((0.0..=100.0).contains(&windowed));
    }
}
