//! Progress events emitted by the sync manager.
//!
//! `EventBus` fans events out to subscribers (UI indicators, daemon logging).
//! Wrap the bus in `Arc` to subscribe; dropping the returned `Subscription`
//! unsubscribes.

use crate::model::EntityType;
use crate::queue::SyncOperation;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Sync events for real-time monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A drain-and-pull cycle began.
    #[serde(rename_all = "camelCase")]
    CycleStarted {
        user_id: String,
        /// Items waiting when the cycle began
        pending: usize,
        /// Milliseconds since Unix epoch
        timestamp: f64,
    },
    /// A queue item was confirmed by the remote store.
    #[serde(rename_all = "camelCase")]
    ItemSynced {
        entity_type: EntityType,
        entity_id: String,
        operation: SyncOperation,
        timestamp: f64,
    },
    /// A queue item failed and stays queued.
    #[serde(rename_all = "camelCase")]
    ItemFailed {
        entity_type: EntityType,
        entity_id: String,
        operation: SyncOperation,
        error: String,
        /// Retry budget exhausted
        terminal: bool,
        timestamp: f64,
    },
    /// A remote entity was written to the local store.
    #[serde(rename_all = "camelCase")]
    EntityPulled {
        entity_type: EntityType,
        entity_id: String,
        timestamp: f64,
    },
    /// The remote store refused our credentials; the cycle stopped.
    #[serde(rename_all = "camelCase")]
    AuthExpired { user_id: String, timestamp: f64 },
    /// A cycle ended.
    #[serde(rename_all = "camelCase")]
    CycleFinished {
        user_id: String,
        pushed: usize,
        pulled: usize,
        failed: usize,
        duration_ms: f64,
        timestamp: f64,
    },
}

/// Current time in milliseconds since Unix epoch, as carried by events.
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pulled(id: &str) -> SyncEvent {
        SyncEvent::EntityPulled {
            entity_type: EntityType::Gift,
            entity_id: id.into(),
            timestamp: 1000.0,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event);
        });
        bus.emit(pulled("g1"));

        assert_eq!(*seen.lock().unwrap(), vec![pulled("g1")]);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(pulled("g1"));
            assert_eq!(bus.subscriber_count(), 1);
        }

        bus.emit(pulled("g2"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::ItemFailed {
            entity_type: EntityType::Return,
            entity_id: "r1".into(),
            operation: SyncOperation::Update,
            error: "Request timed out".into(),
            terminal: false,
            timestamp: 1234.0,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"itemFailed\""));
        assert!(json.contains("\"entityType\":\"return\""));
        assert!(json.contains("\"entityId\":\"r1\""));
        assert!(json.contains("\"operation\":\"update\""));
    }
}
