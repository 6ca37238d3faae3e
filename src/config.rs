//! Manager configuration
//!
//! Loaded from YAML or built in code. Every field has a default, so an empty
//! document is a valid configuration.
//!
//! ```yaml
//! global_limit: 268435456
//! enable_windowed_stats: true
//! rebalancing_grace_period_ms: 5000
//! rebalance_interval_ms: 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::MANAGER_MIN_SIZE;
use crate::error::{Error, Result};

/// Cache manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Global memory limit in bytes, shared by all caches.
    /// Default: 256MB
    pub global_limit: u64,

    /// Keep windowed find statistics for the manager as a whole.
    pub enable_windowed_stats: bool,

    /// After a rebalance, caches may not grow above their deserved size for
    /// this long.
    pub rebalancing_grace_period_ms: u64,

    /// Largest value a cache accepts, in bytes.
    pub max_value_size: u64,

    /// Interval of the background rebalancer.
    pub rebalance_interval_ms: u64,
}

fn default_global_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_max_value_size() -> u64 {
    16 * 1024 * 1024
}

fn default_rebalance_interval_ms() -> u64 {
    2000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            global_limit: default_global_limit(),
            enable_windowed_stats: false,
            rebalancing_grace_period_ms: default_grace_period_ms(),
            max_value_size: default_max_value_size(),
            rebalance_interval_ms: default_rebalance_interval_ms(),
        }
    }
}

impl ManagerConfig {
    pub fn rebalancing_grace_period(&self) -> Duration {
        Duration::from_millis(self.rebalancing_grace_period_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.global_limit < MANAGER_MIN_SIZE {
            return Err(Error::Config(format!(
                "global_limit must be at least {} bytes, got {}",
                MANAGER_MIN_SIZE, self.global_limit
            )));
        }
        if self.max_value_size == 0 {
            return Err(Error::Config("max_value_size must be positive".into()));
        }
        if self.rebalance_interval_ms == 0 {
            return Err(Error::Config("rebalance_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
