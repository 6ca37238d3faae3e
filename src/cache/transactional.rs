//! Transactional Cache
//!
//! Blacklist markers are stamped with the registry's current term. Each
//! bucket lazily catches up with the registry's committed term whenever it
//! is locked and drops markers older than that term. A marker therefore
//! blocks inserts of its hash until every write that could have produced
//! it, and every read that overlapped such a write, has ended.
//!
//! When one write blacklists more hashes in a bucket than the marker ring
//! holds, the bucket saturates and refuses every insert until the committed
//! term moves past it.

use std::sync::Arc;

use super::bucket::MarkerOverflow;
use super::core::{BlacklistPolicy, CacheCore};
use super::table::BucketGuard;
use super::transaction::TransactionManager;
use super::CacheType;

/// Term-scoped blacklisting backed by a transaction registry
#[derive(Debug, Clone)]
pub struct TransactionalPolicy {
    transactions: Arc<TransactionManager>,
}

impl TransactionalPolicy {
    pub fn new(transactions: Arc<TransactionManager>) -> Self {
        Self { transactions }
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }
}

impl BlacklistPolicy for TransactionalPolicy {
    const CACHE_TYPE: CacheType = CacheType::Transactional;

    fn marker_term(&self) -> u64 {
        self.transactions.term()
    }

    fn refresh(&self, bucket: &mut BucketGuard<'_>) {
        bucket
            .state_mut()
            .refresh_term(self.transactions.committed_term());
    }

    fn overflow(&self) -> MarkerOverflow {
        MarkerOverflow::Saturate
    }
}

/// Cache whose blacklist respects transaction terms
pub type TransactionalCache<H> = CacheCore<H, TransactionalPolicy>;

// =============================================================================
// Tests
// =============================================================================
