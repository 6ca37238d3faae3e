//! Cache Manager Metrics
//!
//! Counters and durations for background tasks and manager requests, plus a
//! Prometheus exporter that mirrors memory statistics as gauges and counts
//! lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::events::{CacheEvent, EventKind, EventSink};
use super::manager::MemoryStats;
use crate::error::{Error, Result};

/// Which background task a measurement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FreeMemory,
    Migrate,
}

/// Manager-side counters
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    free_memory_dispatched: AtomicU64,
    migrate_dispatched: AtomicU64,
    dispatch_failures: AtomicU64,

    free_memory_completed: AtomicU64,
    migrate_completed: AtomicU64,
    migrate_failed: AtomicU64,

    // Task run time (microseconds)
    free_memory_duration_us: AtomicU64,
    migrate_duration_us: AtomicU64,
    last_free_memory_us: AtomicU64,
    last_migrate_us: AtomicU64,

    grow_granted: AtomicU64,
    grow_refused: AtomicU64,
    migrate_granted: AtomicU64,
    migrate_refused: AtomicU64,

    rebalances: AtomicU64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self, kind: TaskKind, accepted: bool) {
        if !accepted {
            self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match kind {
            TaskKind::FreeMemory => self.free_memory_dispatched.fetch_add(1, Ordering::Relaxed),
            TaskKind::Migrate => self.migrate_dispatched.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_task_completion(&self, kind: TaskKind, success: bool, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        match kind {
            TaskKind::FreeMemory => {
                self.free_memory_completed.fetch_add(1, Ordering::Relaxed);
                self.free_memory_duration_us.fetch_add(micros, Ordering::Relaxed);
                self.last_free_memory_us.store(micros, Ordering::Relaxed);
            }
            TaskKind::Migrate => {
                if success {
                    self.migrate_completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.migrate_failed.fetch_add(1, Ordering::Relaxed);
                }
                self.migrate_duration_us.fetch_add(micros, Ordering::Relaxed);
                self.last_migrate_us.store(micros, Ordering::Relaxed);
            }
        }
    }

    pub fn record_grow_request(&self, granted: bool) {
        if granted {
            self.grow_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.grow_refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_migrate_request(&self, granted: bool) {
        if granted {
            self.migrate_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.migrate_refused.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            free_memory_dispatched: self.free_memory_dispatched.load(Ordering::Relaxed),
            migrate_dispatched: self.migrate_dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            free_memory_completed: self.free_memory_completed.load(Ordering::Relaxed),
            migrate_completed: self.migrate_completed.load(Ordering::Relaxed),
            migrate_failed: self.migrate_failed.load(Ordering::Relaxed),
            free_memory_duration_us: self.free_memory_duration_us.load(Ordering::Relaxed),
            migrate_duration_us: self.migrate_duration_us.load(Ordering::Relaxed),
            last_free_memory_us: self.last_free_memory_us.load(Ordering::Relaxed),
            last_migrate_us: self.last_migrate_us.load(Ordering::Relaxed),
            grow_granted: self.grow_granted.load(Ordering::Relaxed),
            grow_refused: self.grow_refused.load(Ordering::Relaxed),
            migrate_granted: self.migrate_granted.load(Ordering::Relaxed),
            migrate_refused: self.migrate_refused.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ManagerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub free_memory_dispatched: u64,
    pub migrate_dispatched: u64,
    pub dispatch_failures: u64,
    pub free_memory_completed: u64,
    pub migrate_completed: u64,
    pub migrate_failed: u64,
    pub free_memory_duration_us: u64,
    pub migrate_duration_us: u64,
    pub last_free_memory_us: u64,
    pub last_migrate_us: u64,
    pub grow_granted: u64,
    pub grow_refused: u64,
    pub migrate_granted: u64,
    pub migrate_refused: u64,
    pub rebalances: u64,
}

// =============================================================================
// Prometheus
// =============================================================================

/// Prometheus view of a manager
///
/// Owns its registry so several managers (tests) can coexist. Memory gauges
/// are refreshed by [`PrometheusExporter::update`]; event counts are fed by
/// installing the exporter as an [`EventSink`].
pub struct PrometheusExporter {
    registry: Registry,
    global_limit: IntGauge,
    global_allocation: IntGauge,
    spare_allocation: IntGauge,
    active_tables: IntGauge,
    spare_tables: IntGauge,
    caches: IntGauge,
    hit_rate_lifetime: Gauge,
    hit_rate_windowed: Gauge,
    events: IntCounterVec,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus registry error: {}", e))
}

impl PrometheusExporter {
    pub fn new(prefix: &str) -> Result<Self> {
        let registry = Registry::new();
        let int_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(format!("{prefix}_{name}"), help).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let global_limit = int_gauge("global_limit_bytes", "Global memory limit")?;
        let global_allocation = int_gauge("global_allocation_bytes", "Memory charged to the budget")?;
        let spare_allocation = int_gauge("spare_allocation_bytes", "Memory held by pooled tables")?;
        let active_tables = int_gauge("active_tables", "Tables in use by caches")?;
        let spare_tables = int_gauge("spare_tables", "Tables kept in the pool")?;
        let caches = int_gauge("caches", "Registered caches")?;

        let float_gauge = |name: &str, help: &str| -> Result<Gauge> {
            let gauge = Gauge::new(format!("{prefix}_{name}"), help).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let hit_rate_lifetime = float_gauge("hit_rate_lifetime_percent", "Lifetime find hit rate")?;
        let hit_rate_windowed = float_gauge("hit_rate_windowed_percent", "Windowed find hit rate")?;

        let events = IntCounterVec::new(
            Opts::new(format!("{prefix}_events_total"), "Cache manager lifecycle events"),
            &["type"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(events.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            global_limit,
            global_allocation,
            spare_allocation,
            active_tables,
            spare_tables,
            caches,
            hit_rate_lifetime,
            hit_rate_windowed,
            events,
        })
    }

    /// Refresh gauges from a memory snapshot and hit rates
    pub fn update(&self, stats: &MemoryStats, hit_rates: (f64, f64)) {
        let clamp = |v: u64| v.min(i64::MAX as u64) as i64;
        self.global_limit.set(clamp(stats.global_limit));
        self.global_allocation.set(clamp(stats.global_allocation));
        self.spare_allocation.set(clamp(stats.spare_allocation));
        self.active_tables.set(clamp(stats.active_tables));
        self.spare_tables.set(clamp(stats.spare_tables));
        self.caches.set(clamp(stats.caches));
        // NaN means "no data"; export zero instead
        self.hit_rate_lifetime
            .set(if hit_rates.0.is_nan() { 0.0 } else { hit_rates.0 });
        self.hit_rate_windowed
            .set(if hit_rates.1.is_nan() { 0.0 } else { hit_rates.1 });
    }

    pub fn event_count(&self, kind: EventKind) -> u64 {
        self.events.with_label_values(&[kind.as_str()]).get()
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl EventSink for PrometheusExporter {
    fn publish(&self, event: CacheEvent) {
        self.events.with_label_values(&[event.event_type()]).inc();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_task_metrics() {
        let metrics = ManagerMetrics::new();
        metrics.record_dispatch(TaskKind::FreeMemory, true);
        metrics.record_dispatch(TaskKind::Migrate, false);
        metrics.record_task_completion(TaskKind::FreeMemory, true, Duration::from_micros(250));
        metrics.record_task_completion(TaskKind::Migrate, false, Duration::from_micros(100));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.free_memory_dispatched, 1);
        assert_eq!(snapshot.migrate_dispatched, 0);
        assert_eq!(snapshot.dispatch_failures, 1);
        assert_eq!(snapshot.free_memory_completed, 1);
        assert_eq!(snapshot.last_free_memory_us, 250);
        assert_eq!(snapshot.migrate_failed, 1);
        assert_eq!(snapshot.migrate_completed, 0);
    }

    #[test]
    fn test_request_metrics() {
        let metrics = ManagerMetrics::new();
        metrics.record_grow_request(true);
        metrics.record_grow_request(false);
        metrics.record_migrate_request(false);
        metrics.record_rebalance();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.grow_granted, 1);
        assert_eq!(snapshot.grow_refused, 1);
        assert_eq!(snapshot.migrate_refused, 1);
        assert_eq!(snapshot.rebalances, 1);
    }

    #[test]
    fn test_prometheus_exporter() {
        let exporter = PrometheusExporter::new("cachemgr").unwrap();
        exporter.update(
            &MemoryStats {
                global_limit: 1 << 20,
                global_allocation: 4096,
                ..Default::default()
            },
            (f64::NAN, 50.0),
        );
        exporter.publish(CacheEvent::CacheDestroyed {
            cache_id: 1,
            timestamp: Utc::now(),
        });
        assert_eq!(exporter.event_count(EventKind::CacheDestroyed), 1);
        assert_eq!(exporter.event_count(EventKind::CacheCreated), 0);

        let text = exporter.encode().unwrap();
        assert!(text.contains("cachemgr_global_limit_bytes 1048576"));
        assert!(text.contains("cachemgr_hit_rate_windowed_percent 50"));
        assert!(text.contains("cachemgr_events_total{type=\"cache_destroyed\"} 1"));
    }
}
