//! Error types for the cache manager

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache manager
///
/// Cache data operations (find, insert, remove, blacklist) never return
/// errors; they report outcomes. These variants cover manager-level
/// operations and configuration.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Manager Errors
    // =========================================================================
    /// A global process (rebalance or resize) is already running
    #[error("Manager busy: {0}")]
    TransientBusy(String),

    /// No room below the global high-water mark
    #[error("Global budget exceeded: requested {requested} bytes, {available} available")]
    BudgetExceeded { requested: u64, available: u64 },

    /// Operation refused because the manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Requested cache size is below the minimum allocation
    #[error("Invalid cache size {requested}: minimum is {minimum}")]
    InvalidCacheSize { requested: u64, minimum: u64 },

    /// Requested global limit cannot accommodate the current state
    #[error("Invalid global limit {0}")]
    InvalidLimit(u64),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the caller may retry the operation later
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientBusy(_) | Error::BudgetExceeded { .. })
    }
}
