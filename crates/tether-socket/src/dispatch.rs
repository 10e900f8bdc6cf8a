use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use tether_core::status::ConnectionStatus;

type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Token identifying one registration. `off` removes exactly the
/// registration it was returned for and no other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Event-type name → ordered handler list.
///
/// Multiple handlers per type all fire, in insertion order. Handlers run
/// outside the map guard, so a handler may register or unregister from
/// within its own invocation.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: DashMap<String, Vec<(HandlerId, EventHandler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one registration. Returns whether anything was removed.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        match self.handlers.get_mut(event_type) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(hid, _)| *hid != id);
                before != entry.len()
            }
            None => false,
        }
    }

    /// Invoke every handler registered for `event_type`, in insertion order.
    /// Unknown types dispatch to nobody. Returns the number invoked.
    pub fn dispatch(&self, event_type: &str, data: &Value) -> usize {
        let snapshot: Vec<EventHandler> = match self.handlers.get(event_type) {
            Some(entry) => entry.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(data);
        }
        snapshot.len()
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, |entry| entry.len())
    }
}

/// Observers of connection status transitions.
#[derive(Default)]
pub struct StatusRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, StatusHandler)>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> StatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(handler)));
        StatusSubscription {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Deliver one transition to every currently-registered observer.
    pub fn emit(&self, status: ConnectionStatus) {
        let snapshot: Vec<StatusHandler> = self
            .observers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in &snapshot {
            handler(status);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    fn remove(&self, id: u64) {
        self.observers.lock().retain(|(oid, _)| *oid != id);
    }
}

/// Removes its observer when [`StatusSubscription::unsubscribe`] is called.
/// Dropping the handle without calling it leaves the observer registered.
pub struct StatusSubscription {
    registry: Arc<StatusRegistry>,
    id: u64,
}

impl StatusSubscription {
    pub fn unsubscribe(self) {
        self.registry.remove(self.id);
    }
}
