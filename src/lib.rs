//! cachemgr - In-Process Multi-Cache Manager
//!
//! Many independent hash-table caches share one global memory budget. A
//! manager hands memory to the caches that are accessed most, grows and
//! shrinks their tables in the background, and supports transactional
//! blacklisting so readers never see values invalidated by open writers.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Cache (find / insert / remove / blacklist)
//!              │  grow / migrate requests
//!              ▼
//!           Manager ──▶ Executor ──▶ FreeMemoryTask / MigrateTask
//!              ▲
//!           Rebalancer (periodic)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Manager, caches, tables, tasks and statistics
//! - [`config`] - Manager configuration
//! - [`error`] - Error types
//! - [`sync`] - Spin locks used by buckets, metadata and the manager

pub mod cache;
pub mod config;
pub mod error;
pub mod sync;

// Re-export commonly used types
pub use cache::{
    BinaryKeyHasher, Cache, CacheType, Finding, InsertOutcome, KeyHasher, Manager, MemoryStats,
    RejectReason, StructuredKeyHasher,
};
pub use config::ManagerConfig;
pub use error::{Error, Result};
