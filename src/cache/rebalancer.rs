//! Periodic rebalancing
//!
//! Runs [`Manager::rebalance`] on a fixed interval until cancelled. A round
//! refused because another global process is running is skipped silently;
//! the loop stops by itself once the manager shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::manager::Manager;
use crate::error::Error;

/// Background driver of rebalance rounds
pub struct Rebalancer {
    manager: Arc<Manager>,
    period: Duration,
    cancel: CancellationToken,
}

impl Rebalancer {
    pub fn new(manager: Arc<Manager>, period: Duration) -> Self {
        Self {
            manager,
            period,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled or the manager shuts down; returns the number of
    /// completed rounds
    #[instrument(skip(self), fields(period_ms = self.period.as_millis() as u64))]
    pub async fn run(self) -> u64 {
        info!("Starting rebalancer");
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rounds = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(rounds, "Rebalancer cancelled");
                    break;
                }
                _ = tick.tick() => {
                    match self.manager.rebalance() {
                        Ok(()) => rounds += 1,
                        Err(Error::TransientBusy(reason)) => {
                            debug!(%reason, "Rebalance skipped");
                        }
                        Err(Error::ShuttingDown) => {
                            info!(rounds, "Manager shutting down, rebalancer stopped");
                            break;
                        }
                        Err(e) => error!("Rebalance failed: {}", e),
                    }
                }
            }
        }
        rounds
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(self) -> (CancellationToken, tokio::task::JoinHandle<u64>) {
        let token = self.cancellation_token();
        (token, tokio::spawn(self.run()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BinaryKeyHasher, CacheType, ManualExecutor};
    use crate::config::ManagerConfig;

    fn manager() -> Arc<Manager> {
        let config = ManagerConfig {
            global_limit: 16 * 1024 * 1024,
            ..Default::default()
        };
        Manager::new(config, Arc::new(ManualExecutor::new())).unwrap()
    }

    #[tokio::test]
    async fn test_rebalancer_runs_until_cancelled() {
        let manager = manager();
        let cache = manager
            .create_cache::<BinaryKeyHasher>(CacheType::Plain, 4 * 1024 * 1024, false)
            .unwrap();

        let rebalancer = Rebalancer::new(Arc::clone(&manager), Duration::from_millis(5));
        let (token, handle) = rebalancer.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let rounds = handle.await.unwrap();
        assert!(rounds >= 1);
        assert_eq!(manager.metrics().snapshot().rebalances, rounds);
        assert!(cache.metadata().lock().deserved_size >= crate::cache::MIN_CACHE_ALLOCATION);
        manager.destroy_cache(&cache);
    }

    #[tokio::test]
    async fn test_rebalancer_stops_on_shutdown() {
        let manager = manager();
        let _cache = manager
            .create_cache::<BinaryKeyHasher>(CacheType::Plain, 4 * 1024 * 1024, false)
            .unwrap();
        manager.begin_shutdown();

        let rebalancer = Rebalancer::new(Arc::clone(&manager), Duration::from_millis(1));
        let rounds = tokio::time::timeout(Duration::from_secs(5), rebalancer.run())
            .await
            .unwrap();
        assert_eq!(rounds, 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_rebalancer_stops_after_full_shutdown() {
        let manager = manager();
        let _cache = manager
            .create_cache::<BinaryKeyHasher>(CacheType::Plain, 4 * 1024 * 1024, false)
            .unwrap();
        manager.shutdown();
        assert!(manager.caches().is_empty());

        let rebalancer = Rebalancer::new(Arc::clone(&manager), Duration::from_millis(1));
        let rounds = tokio::time::timeout(Duration::from_millis(500), rebalancer.run())
            .await
            .expect("rebalancer should stop once the manager is shut down");
        assert_eq!(rounds, 0);
        assert_eq!(manager.metrics().snapshot().rebalances, 0);
    }
}
