//! Property-Based Tests for Caches
//!
//! Random operation sequences are replayed against a cache and a simple
//! model. A cache may drop records at any time (eviction), so the model
//! tracks which values a key is still allowed to return rather than exact
//! contents.
//!
//! # Test Properties
//!
//! 1. **No stale reads**: a find never returns a removed, blacklisted or
//!    overwritten value
//! 2. **Usage accounting**: usage returns to zero once every key is removed
//! 3. **Migration preservation**: growing the table keeps every record
//! 4. **Collisions**: the above hold with a hasher producing few hashes

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::{
    BinaryKeyHasher, Cache, CacheType, InsertOutcome, KeyHasher, Manager, ManualExecutor,
    RejectReason,
};
use crate::config::ManagerConfig;

/// Only sixteen distinct hashes, spread over the table
struct CollidingHasher;

impl KeyHasher for CollidingHasher {
    const NAME: &'static str = "colliding";

    fn hash_key(key: &[u8]) -> u64 {
        let h = key.iter().fold(0u64, |h, b| h.wrapping_add(*b as u64)) % 16;
        (h + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, Vec<u8>),
    Find(u8),
    Remove(u8),
    Blacklist(u8),
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0u8..48;
    prop_oneof![
        4 => (key.clone(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(k, v)| Op::Insert(k, v)),
        3 => key.clone().prop_map(Op::Find),
        2 => key.clone().prop_map(Op::Remove),
        1 => key.prop_map(Op::Blacklist),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..300)
}

fn cache_type_strategy() -> impl Strategy<Value = CacheType> {
    prop_oneof![Just(CacheType::Plain), Just(CacheType::Transactional)]
}

fn manager() -> (Arc<Manager>, Arc<ManualExecutor>) {
    let executor = Arc::new(ManualExecutor::new());
    let config = ManagerConfig {
        global_limit: 16 * 1024 * 1024,
        ..Default::default()
    };
    let manager = Manager::new(config, executor.clone()).expect("manager");
    (manager, executor)
}

fn key_bytes(key: u8) -> Vec<u8> {
    format!("key-{key}").into_bytes()
}

/// Replay `ops`, checking every find against the model
fn replay(cache: &dyn Cache, ops: &[Op]) -> Result<HashMap<u8, Vec<Vec<u8>>>, TestCaseError> {
    // values each key may still return
    let mut allowed: HashMap<u8, Vec<Vec<u8>>> = HashMap::new();

    for op in ops {
        match op {
            Op::Insert(k, v) => match cache.insert(&key_bytes(*k), v) {
                InsertOutcome::Inserted | InsertOutcome::Replaced => {
                    allowed.insert(*k, vec![v.clone()]);
                }
                InsertOutcome::Rejected(RejectReason::Blacklisted) => {
                    allowed.remove(k);
                }
                InsertOutcome::Rejected(_) => {}
            },
            Op::Find(k) => {
                if let Some(found) = cache.find(&key_bytes(*k)) {
                    let values = allowed.get(k).cloned().unwrap_or_default();
                    prop_assert!(
                        values.iter().any(|v| v.as_slice() == found.value()),
                        "stale value for key {}", k
                    );
                    let expected_key = key_bytes(*k);
                    prop_assert_eq!(found.key(), expected_key.as_slice());
                }
            }
            Op::Remove(k) => {
                let removed = cache.remove(&key_bytes(*k));
                if removed {
                    prop_assert!(allowed.contains_key(k));
                }
                allowed.remove(k);
            }
            Op::Blacklist(k) => {
                cache.blacklist(&key_bytes(*k));
                allowed.remove(k);
                prop_assert!(cache.find(&key_bytes(*k)).is_none());
            }
        }
        let meta = cache.metadata().lock();
        prop_assert!(meta.usage <= meta.hard_usage_limit);
    }
    Ok(allowed)
}

// =============================================================================
// Model Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: finds only return the latest stored value.
    #[test]
    fn prop_no_stale_reads(cache_type in cache_type_strategy(), ops in ops_strategy()) {
        let (manager, _executor) = manager();
        let cache = manager
            .create_cache::<BinaryKeyHasher>(cache_type, 4 * 1024 * 1024, false)
            .expect("cache");
        replay(cache.as_ref(), &ops)?;
        manager.destroy_cache(&cache);
    }

    /// Property: with heavy hash collisions finds stay correct.
    #[test]
    fn prop_no_stale_reads_colliding(cache_type in cache_type_strategy(), ops in ops_strategy()) {
        let (manager, _executor) = manager();
        let cache = manager
            .create_cache::<CollidingHasher>(cache_type, 4 * 1024 * 1024, false)
            .expect("cache");
        replay(cache.as_ref(), &ops)?;
        manager.destroy_cache(&cache);
    }

    /// Property: removing every key returns usage to zero.
    #[test]
    fn prop_usage_returns_to_zero(cache_type in cache_type_strategy(), ops in ops_strategy()) {
        let (manager, _executor) = manager();
        let cache = manager
            .create_cache::<CollidingHasher>(cache_type, 4 * 1024 * 1024, false)
            .expect("cache");
        replay(cache.as_ref(), &ops)?;
        for k in 0u8..48 {
            cache.remove(&key_bytes(k));
        }
        prop_assert_eq!(cache.usage(), 0);
        prop_assert_eq!(cache.stats().entries, 0);
        manager.destroy_cache(&cache);
    }
}

// =============================================================================
// Migration Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: migrating into a larger table keeps every record.
    #[test]
    fn prop_migration_preserves_records(
        cache_type in cache_type_strategy(),
        entries in prop::collection::hash_map(0u32..100_000, prop::collection::vec(any::<u8>(), 1..32), 1..400),
    ) {
        let (manager, executor) = manager();
        let cache = manager
            .create_cache::<BinaryKeyHasher>(cache_type, 8 * 1024 * 1024, false)
            .expect("cache");
        for (k, v) in &entries {
            cache.insert(&k.to_be_bytes(), v);
        }
        let before: Vec<(u32, Vec<u8>)> = entries
            .iter()
            .filter_map(|(k, _)| cache.find(&k.to_be_bytes()).map(|f| (*k, f.value().to_vec())))
            .collect();
        let usage = cache.usage();
        let log_size = cache.stats().log_size;

        let (granted, _) = manager.request_migrate(&cache, log_size + 1);
        prop_assert!(granted);
        prop_assert_eq!(executor.run_pending(), 1);

        prop_assert_eq!(cache.stats().log_size, log_size + 1);
        prop_assert_eq!(cache.usage(), usage);
        for (k, v) in &before {
            let found = cache.find(&k.to_be_bytes());
            prop_assert!(found.is_some(), "lost key {}", k);
            prop_assert_eq!(found.map(|f| f.value().to_vec()), Some(v.clone()));
        }
        manager.destroy_cache(&cache);
    }

    /// Property: open-write blacklisting survives a migration.
    #[test]
    fn prop_migration_keeps_blacklist(keys in prop::collection::hash_set(0u32..100_000, 1..64)) {
        let (manager, executor) = manager();
        let cache = manager
            .create_cache::<BinaryKeyHasher>(CacheType::Transactional, 8 * 1024 * 1024, false)
            .expect("cache");
        let tx = manager.begin_transaction(false);
        let mut blocked = Vec::new();
        for k in &keys {
            cache.blacklist(&k.to_be_bytes());
            if cache.insert(&k.to_be_bytes(), b"v") == InsertOutcome::Rejected(RejectReason::Blacklisted) {
                blocked.push(*k);
            }
        }

        let log_size = cache.stats().log_size;
        let (granted, _) = manager.request_migrate(&cache, log_size + 1);
        prop_assert!(granted);
        executor.run_pending();

        for k in &blocked {
            prop_assert_eq!(
                cache.insert(&k.to_be_bytes(), b"v"),
                InsertOutcome::Rejected(RejectReason::Blacklisted)
            );
        }
        manager.end_transaction(tx);
        manager.destroy_cache(&cache);
    }
}
