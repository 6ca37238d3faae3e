//! Transaction Registry
//!
//! Tracks open read and write transactions so transactional caches can tell
//! whether a blacklist marker is still binding.
//!
//! # Terms
//!
//! - `term` is odd while any write (or sensitive read) is open and even
//!   otherwise
//! - `committed_term` is the value `term` took when the last write or
//!   sensitive read closed
//! - `open_read_term` / `open_write_term` advance on every read / write
//!   begin and end
//!
//! A read that begins while writes are open is *sensitive*: it may observe
//! pre-write data, so the term stays odd until it ends as well.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

/// Handle for an open transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    read_only: bool,
    sensitive: bool,
    /// `term` at the moment the transaction began
    term: u64,
}

impl Transaction {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    pub fn term(&self) -> u64 {
        self.term
    }
}

/// Snapshot of the registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub open_reads: u64,
    pub open_writes: u64,
    pub open_sensitive: u64,
    pub term: u64,
    pub open_read_term: u64,
    pub open_write_term: u64,
    pub committed_term: u64,
}

/// Registry of open transactions
///
/// `term` and `committed_term` are mirrored into atomics so bucket accesses
/// can read them without taking the registry lock.
#[derive(Debug, Default)]
pub struct TransactionManager {
    state: Mutex<TransactionStats>,
    term: AtomicU64,
    committed_term: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction
    pub fn begin(&self, read_only: bool) -> Transaction {
        let mut state = self.state.lock();
        let sensitive = if read_only {
            state.open_reads += 1;
            state.open_read_term += 1;
            state.open_writes > 0
        } else {
            state.open_writes += 1;
            state.open_write_term += 1;
            true
        };
        if sensitive {
            state.open_sensitive += 1;
            if state.term % 2 == 0 {
                state.term += 1;
            }
        }
        self.term.store(state.term, Ordering::Release);
        trace!(read_only, sensitive, term = state.term, "Transaction begun");
        Transaction {
            read_only,
            sensitive,
            term: state.term,
        }
    }

    /// Close a transaction
    pub fn end(&self, tx: Transaction) {
        let mut state = self.state.lock();
        if tx.read_only {
            debug_assert!(state.open_reads > 0);
            state.open_reads = state.open_reads.saturating_sub(1);
            state.open_read_term += 1;
        } else {
            debug_assert!(state.open_writes > 0);
            state.open_writes = state.open_writes.saturating_sub(1);
            state.open_write_term += 1;
        }
        if tx.sensitive {
            debug_assert!(state.open_sensitive > 0);
            state.open_sensitive = state.open_sensitive.saturating_sub(1);
            if state.open_sensitive == 0 && state.term % 2 == 1 {
                state.term += 1;
                state.committed_term = state.term;
            }
        }
        self.term.store(state.term, Ordering::Release);
        self.committed_term
            .store(state.committed_term, Ordering::Release);
        trace!(term = state.term, committed = state.committed_term, "Transaction ended");
    }

    /// Current term; odd while writes are open
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// Term of the last completed write phase
    pub fn committed_term(&self) -> u64 {
        self.committed_term.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransactionStats {
        *self.state.lock()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_does_not_open_term() {
        let registry = TransactionManager::new();
        let tx = registry.begin(true);
        assert!(!tx.is_sensitive());
        assert_eq!(registry.term(), 0);
        registry.end(tx);
        let stats = registry.stats();
        assert_eq!(stats.term, 0);
        assert_eq!(stats.open_read_term, 2);
        assert_eq!(stats.committed_term, 0);
    }

    #[test]
    fn test_write_opens_and_commits_term() {
        let registry = TransactionManager::new();
        let tx = registry.begin(false);
        assert_eq!(registry.term(), 1);
        assert_eq!(registry.committed_term(), 0);
        registry.end(tx);
        assert_eq!(registry.term(), 2);
        assert_eq!(registry.committed_term(), 2);
        assert_eq!(registry.stats().open_write_term, 2);
    }

    #[test]
    fn test_overlapping_writes_share_term() {
        let registry = TransactionManager::new();
        let a = registry.begin(false);
        let b = registry.begin(false);
        assert_eq!(a.term(), b.term());
        registry.end(a);
        assert_eq!(registry.term(), 1);
        registry.end(b);
        assert_eq!(registry.term(), 2);
    }

    #[test]
    fn test_sensitive_read_holds_term_open() {
        let registry = TransactionManager::new();
        let write = registry.begin(false);
        let read = registry.begin(true);
        assert!(read.is_sensitive());
        registry.end(write);
        assert_eq!(registry.term() % 2, 1);
        assert_eq!(registry.committed_term(), 0);
        registry.end(read);
        assert_eq!(registry.term(), 2);
        assert_eq!(registry.committed_term(), 2);
        let stats = registry.stats();
        assert_eq!(stats.open_reads, 0);
        assert_eq!(stats.open_writes, 0);
        assert_eq!(stats.open_sensitive, 0);
    }

    #[test]
    fn test_terms_are_monotone() {
        let registry = TransactionManager::new();
        let mut last = registry.stats();
        for i in 0..20 {
            let tx = registry.begin(i % 3 == 0);
            registry.end(tx);
            let now = registry.stats();
            assert!(now.term >= last.term);
            assert!(now.committed_term >= last.committed_term);
            assert!(now.open_read_term >= last.open_read_term);
            assert!(now.open_write_term >= last.open_write_term);
            last = now;
        }
    }
}
