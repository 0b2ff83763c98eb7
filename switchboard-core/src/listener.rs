//! Event bus for call lifecycle notifications

use crate::types::CallEvent;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Synchronous observer of call events (call log, missed-call notifier, UI)
///
/// Listeners run on the orchestrator's thread after the state lock has been
/// released and must not block.
pub trait CallsListener: Send + Sync {
    /// Handle one event
    fn on_call_event(&self, event: &CallEvent);
}

/// Fans out events to registered listeners and broadcast subscribers
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn CallsListener>>>,
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a bus whose broadcast channel keeps `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn CallsListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener previously added
    pub fn remove_listener(&self, listener: &Arc<dyn CallsListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Subscribe to the broadcast stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event
    ///
    /// Listeners are snapshotted first, so a listener may add or remove
    /// listeners while being notified.
    pub fn publish(&self, event: CallEvent) {
        let listeners: Vec<Arc<dyn CallsListener>> = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_call_event(&event);
        }
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::CallId;
    use parking_lot::Mutex;

    struct SelfRemoving {
        bus: Arc<EventBus>,
        me: Mutex<Option<Arc<dyn CallsListener>>>,
        seen: Mutex<usize>,
    }

    impl CallsListener for SelfRemoving {
        fn on_call_event(&self, _event: &CallEvent) {
            *self.seen.lock() += 1;
            if let Some(me) = self.me.lock().take() {
                self.bus.remove_listener(&me);
            }
        }
    }

    fn hold_failed(id: u64) -> CallEvent {
        CallEvent::HoldFailed {
            call_id: CallId(id),
        }
    }

    #[test]
    fn test_listener_can_unregister_during_delivery() {
        let bus = Arc::new(EventBus::new(8));
        let listener = Arc::new(SelfRemoving {
            bus: Arc::clone(&bus),
            me: Mutex::new(None),
            seen: Mutex::new(0),
        });
        let as_dyn: Arc<dyn CallsListener> = listener.clone();
        *listener.me.lock() = Some(Arc::clone(&as_dyn));
        bus.add_listener(as_dyn);

        bus.publish(hold_failed(1));
        bus.publish(hold_failed(2));
        assert_eq!(*listener.seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(hold_failed(7));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.call_id(), CallId(7));
    }
}
