//! Multi-subscriber status notifier.
//!
//! Delivery is synchronous in the publisher's thread: listeners must not
//! block, or the publisher pays the latency. Registration takes a short
//! critical section that never overlaps delivery, so listeners may
//! subscribe or unsubscribe from within a callback; a registration made
//! during delivery takes effect on the next event.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokenkeep_core::StatusEvent;

/// A registered status listener.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

impl<F> StatusListener for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Handle returned by [`StatusNotifier::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, Arc<dyn StatusListener>>,
}

/// Process-local publish/subscribe of status-change events.
///
/// Clones share the same registry. All listeners observe events in the
/// order a given publisher issued them.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    registry: Arc<RwLock<Registry>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Safe to call from within a listener; the new
    /// registration sees the next event.
    pub fn subscribe(&self, listener: Arc<dyn StatusListener>) -> ListenerId {
        let mut registry = self.registry.write();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, listener);
        ListenerId(id)
    }

    /// Register a closure listener.
    pub fn subscribe_fn<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(f))
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.registry.write().listeners.remove(&id.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.read().listeners.len()
    }

    /// Deliver an event to every listener registered at this moment,
    /// synchronously, in registration order.
    pub fn notify(&self, event: &StatusEvent) {
        // Snapshot under a short read lock, deliver outside it so that a
        // listener can (un)subscribe without deadlocking.
        let snapshot: Vec<Arc<dyn StatusListener>> =
            self.registry.read().listeners.values().cloned().collect();
        tracing::debug!(
            "notifying {} listeners of [{}][{}]",
            snapshot.len(),
            event.tx_id,
            event.status
        );
        for listener in snapshot {
            listener.on_status(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokenkeep_core::TxStatus;

    fn event(tx_id: &str, status: TxStatus) -> StatusEvent {
        StatusEvent {
            tx_id: tx_id.to_string(),
            status,
            message: String::new(),
        }
    }

    #[test]
    fn every_subscriber_sees_every_event_in_order() {
        let notifier = StatusNotifier::new();
        let seen_a: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_b: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for seen in [&seen_a, &seen_b] {
            let seen = seen.clone();
            notifier.subscribe_fn(move |e| seen.lock().push(e.tx_id.clone()));
        }

        for tx in ["t1", "t2", "t3"] {
            notifier.notify(&event(tx, TxStatus::Confirmed));
        }

        assert_eq!(*seen_a.lock(), vec!["t1", "t2", "t3"]);
        assert_eq!(*seen_b.lock(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn unsubscribed_listener_stops_receiving() {
        let notifier = StatusNotifier::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let seen = seen.clone();
            notifier.subscribe_fn(move |e| seen.lock().push(e.tx_id.clone()))
        };

        notifier.notify(&event("t1", TxStatus::Pending));
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.notify(&event("t2", TxStatus::Pending));

        assert_eq!(*seen.lock(), vec!["t1"]);
    }

    #[test]
    fn listener_can_subscribe_from_within_delivery() {
        let notifier = StatusNotifier::new();
        let late_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let notifier_inner = notifier.clone();
            let late_seen = late_seen.clone();
            let registered = Arc::new(Mutex::new(false));
            notifier.subscribe_fn(move |_e| {
                let mut registered = registered.lock();
                if !*registered {
                    *registered = true;
                    let late_seen = late_seen.clone();
                    notifier_inner.subscribe_fn(move |e| late_seen.lock().push(e.tx_id.clone()));
                }
            });
        }

        // first event triggers the nested registration; the new listener
        // only sees the second event
        notifier.notify(&event("t1", TxStatus::Pending));
        notifier.notify(&event("t2", TxStatus::Pending));

        assert_eq!(*late_seen.lock(), vec!["t2"]);
        assert_eq!(notifier.listener_count(), 2);
    }
}
