//! Cache Events
//!
//! Lifecycle events published by the manager: cache creation and
//! destruction, resize and migrate scheduling and completion, and rebalance
//! rounds. Events are immutable records consumed by an [`EventSink`]; the
//! serialized `type` tag equals [`EventKind::as_str`].
//!
//! # Example
//!
//! ```ignore
//! let collector = Arc::new(InMemoryEventCollector::new());
//! let manager = Manager::with_event_sink(config, executor, collector.clone())?;
//! let cache = manager.create_cache::<BinaryKeyHasher>(CacheType::Plain, 1 << 20, false)?;
//! assert_eq!(collector.kinds_for_cache(cache.id()), vec![EventKind::CacheCreated]);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

use super::CacheType;

/// Event emitted by the cache manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    // =========================================================================
    // Cache Lifecycle
    // =========================================================================
    /// A cache was registered with the manager
    CacheCreated {
        cache_id: u64,
        cache_type: CacheType,
        max_size: u64,
        timestamp: DateTime<Utc>,
    },

    /// A cache was shut down and unregistered
    CacheDestroyed {
        cache_id: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Background Tasks
    // =========================================================================
    /// A free-memory task was dispatched
    #[serde(rename = "cache_resize_scheduled")]
    ResizeScheduled {
        cache_id: u64,
        new_limit: u64,
        timestamp: DateTime<Utc>,
    },

    /// A free-memory task finished
    #[serde(rename = "cache_resize_completed")]
    ResizeCompleted {
        cache_id: u64,
        reclaimed: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A migrate task was dispatched
    #[serde(rename = "cache_migrate_scheduled")]
    MigrateScheduled {
        cache_id: u64,
        log_size: u32,
        timestamp: DateTime<Utc>,
    },

    /// A migrate task finished
    #[serde(rename = "cache_migrate_completed")]
    MigrateCompleted {
        cache_id: u64,
        log_size: u32,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Manager
    // =========================================================================
    /// A rebalance round started
    #[serde(rename = "manager_rebalance_scheduled")]
    RebalanceScheduled {
        caches: usize,
        timestamp: DateTime<Utc>,
    },

    /// A rebalance round finished computing deserved sizes
    #[serde(rename = "manager_rebalance_completed")]
    RebalanceCompleted {
        caches: usize,
        shrink_tasks: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Payload-free discriminant of a [`CacheEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CacheCreated,
    CacheDestroyed,
    ResizeScheduled,
    ResizeCompleted,
    MigrateScheduled,
    MigrateCompleted,
    RebalanceScheduled,
    RebalanceCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::CacheCreated,
        EventKind::CacheDestroyed,
        EventKind::ResizeScheduled,
        EventKind::ResizeCompleted,
        EventKind::MigrateScheduled,
        EventKind::MigrateCompleted,
        EventKind::RebalanceScheduled,
        EventKind::RebalanceCompleted,
    ];

    /// Event name, also the serialized tag and the metric label
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CacheCreated => "cache_created",
            EventKind::CacheDestroyed => "cache_destroyed",
            EventKind::ResizeScheduled => "cache_resize_scheduled",
            EventKind::ResizeCompleted => "cache_resize_completed",
            EventKind::MigrateScheduled => "cache_migrate_scheduled",
            EventKind::MigrateCompleted => "cache_migrate_completed",
            EventKind::RebalanceScheduled => "manager_rebalance_scheduled",
            EventKind::RebalanceCompleted => "manager_rebalance_completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::CacheCreated { .. } => EventKind::CacheCreated,
            CacheEvent::CacheDestroyed { .. } => EventKind::CacheDestroyed,
            CacheEvent::ResizeScheduled { .. } => EventKind::ResizeScheduled,
            CacheEvent::ResizeCompleted { .. } => EventKind::ResizeCompleted,
            CacheEvent::MigrateScheduled { .. } => EventKind::MigrateScheduled,
            CacheEvent::MigrateCompleted { .. } => EventKind::MigrateCompleted,
            CacheEvent::RebalanceScheduled { .. } => EventKind::RebalanceScheduled,
            CacheEvent::RebalanceCompleted { .. } => EventKind::RebalanceCompleted,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Cache the event refers to; manager-wide events have none
    pub fn cache_id(&self) -> Option<u64> {
        match self {
            CacheEvent::CacheCreated { cache_id, .. }
            | CacheEvent::CacheDestroyed { cache_id, .. }
            | CacheEvent::ResizeScheduled { cache_id, .. }
            | CacheEvent::ResizeCompleted { cache_id, .. }
            | CacheEvent::MigrateScheduled { cache_id, .. }
            | CacheEvent::MigrateCompleted { cache_id, .. } => Some(*cache_id),
            CacheEvent::RebalanceScheduled { .. } | CacheEvent::RebalanceCompleted { .. } => None,
        }
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Consumer of cache events
///
/// Called from cache and task threads, sometimes under the manager lock;
/// implementations must not block or call back into the manager.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: CacheEvent);
}

/// Sink that discards events
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: CacheEvent) {}
}

/// Writes events to `tracing` with the payload attached as JSON
///
/// Cache creation and destruction are logged at info, a migration that
/// gave up at warn, and routine task and rebalance traffic at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    pub fn level(event: &CacheEvent) -> Level {
        match event {
            CacheEvent::CacheCreated { .. } | CacheEvent::CacheDestroyed { .. } => Level::INFO,
            CacheEvent::MigrateCompleted { success: false, .. } => Level::WARN,
            _ => Level::DEBUG,
        }
    }
}

impl EventSink for LoggingEventSink {
    fn publish(&self, event: CacheEvent) {
        let kind = event.kind();
        let cache_id = event.cache_id();
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        let level = Self::level(&event);
        if level == Level::INFO {
            info!(%kind, ?cache_id, event = %payload, "Cache event");
        } else if level == Level::WARN {
            warn!(%kind, ?cache_id, event = %payload, "Cache event");
        } else {
            debug!(%kind, ?cache_id, event = %payload, "Cache event");
        }
    }
}

/// Records every event; used by tests to assert on manager behaviour
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::Mutex<Vec<CacheEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<CacheEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Event kinds touching `cache_id`, in publication order
    pub fn kinds_for_cache(&self, cache_id: u64) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.cache_id() == Some(cache_id))
            .map(CacheEvent::kind)
            .collect()
    }

    /// Take every recorded event
    pub fn drain(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for InMemoryEventCollector {
    fn publish(&self, event: CacheEvent) {
        self.events.lock().push(event);
    }
}

/// Fans events out to several sinks
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for CompositeEventSink {
    fn publish(&self, event: CacheEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn created(id: u64) -> CacheEvent {
        CacheEvent::CacheCreated {
            cache_id: id,
            cache_type: CacheType::Plain,
            max_size: 1024,
            timestamp: Utc::now(),
        }
    }

    fn migrated(id: u64, success: bool) -> CacheEvent {
        CacheEvent::MigrateCompleted {
            cache_id: id,
            log_size: 9,
            success,
            duration_ms: 3,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_kind_and_id() {
        let event = created(3);
        assert_eq!(event.kind(), EventKind::CacheCreated);
        assert_eq!(event.event_type(), "cache_created");
        assert_eq!(event.cache_id(), Some(3));
        let rebalance = CacheEvent::RebalanceScheduled {
            caches: 2,
            timestamp: Utc::now(),
        };
        assert_eq!(rebalance.event_type(), "manager_rebalance_scheduled");
        assert_eq!(rebalance.cache_id(), None);
    }

    #[test]
    fn test_event_names_are_unique() {
        let names: std::collections::HashSet<_> =
            EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), EventKind::ALL.len());
    }

    #[test]
    fn test_serialized_tag_matches_event_name() {
        let events = [
            created(1),
            migrated(1, true),
            CacheEvent::ResizeScheduled {
                cache_id: 1,
                new_limit: 4096,
                timestamp: Utc::now(),
            },
            CacheEvent::RebalanceCompleted {
                caches: 1,
                shrink_tasks: 0,
                timestamp: Utc::now(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
            let back: CacheEvent = serde_json::from_value(json).unwrap();
            assert_eq!(back.kind(), event.kind());
        }
        let json = serde_json::to_value(created(1)).unwrap();
        assert_eq!(json["cache_type"], "plain");
    }

    #[test]
    fn test_logging_levels() {
        assert_eq!(LoggingEventSink::level(&created(1)), Level::INFO);
        assert_eq!(LoggingEventSink::level(&migrated(1, false)), Level::WARN);
        assert_eq!(LoggingEventSink::level(&migrated(1, true)), Level::DEBUG);
        // must not panic without a subscriber
        LoggingEventSink.publish(migrated(1, false));
    }

    #[test]
    fn test_collector_queries() {
        let collector = InMemoryEventCollector::new();
        collector.publish(created(1));
        collector.publish(created(2));
        collector.publish(migrated(1, true));
        collector.publish(CacheEvent::CacheDestroyed {
            cache_id: 1,
            timestamp: Utc::now(),
        });

        assert_eq!(collector.count(EventKind::CacheCreated), 2);
        assert_eq!(collector.of_kind(EventKind::CacheDestroyed).len(), 1);
        assert_eq!(
            collector.kinds_for_cache(1),
            vec![
                EventKind::CacheCreated,
                EventKind::MigrateCompleted,
                EventKind::CacheDestroyed
            ]
        );
        assert_eq!(collector.kinds_for_cache(2), vec![EventKind::CacheCreated]);
        assert_eq!(collector.drain().len(), 4);
        assert!(collector.events().is_empty());
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(InMemoryEventCollector::new());
        let b = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventSink::new()
            .with_sink(a.clone())
            .with_sink(Arc::new(LoggingEventSink))
            .with_sink(b.clone());
        composite.publish(created(9));
        assert_eq!(a.kinds_for_cache(9), vec![EventKind::CacheCreated]);
        assert_eq!(b.kinds_for_cache(9), vec![EventKind::CacheCreated]);
    }
}
