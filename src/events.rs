//! External invalidation channel.
//!
//! An [`EventSource`] delivers discrete events from outside the cache, such
//! as a session being replaced. Every entry of a cache built with an event
//! source registers one handler at construction and drops it at eviction.
//! What an entry does with an event is decided by its
//! [`InvalidationPolicy`](crate::InvalidationPolicy).
//!
//! [`EventHub`] is an in-process source: whoever owns the identity state
//! calls [`EventHub::emit`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tracing::debug;

/// One external event.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEvent {
    /// Event name, e.g. `"signed_in"`.
    pub kind: String,
    /// Optional event payload.
    pub payload: Option<Value>,
    /// Context flag carried with the event, e.g. whether a session is
    /// active after it.
    pub active: bool,
}

impl ExternalEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            active: false,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Callback registered with an event source.
pub type EventHandler = Arc<dyn Fn(&ExternalEvent) + Send + Sync>;

/// A source of external events.
pub trait EventSource: Send + Sync {
    /// Register `handler`. Dropping the returned subscription unregisters it.
    fn on_event(&self, handler: EventHandler) -> EventSubscription;
}

/// Registration with an [`EventSource`]. Unregisters on drop.
pub struct EventSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSubscription {
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, EventHandler>>,
}

/// In-process event source. Handlers run synchronously in registration order.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every registered handler.
    ///
    /// Handlers run outside the hub's lock, so they may register or drop
    /// subscriptions. Returns the number of handlers invoked.
    pub fn emit(&self, event: ExternalEvent) -> usize {
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        debug!(kind = %event.kind, handlers = handlers.len(), "emitting external event");
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSource for EventHub {
    fn on_event(&self, handler: EventHandler) -> EventSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);

        let hub: Weak<HubInner> = Arc::downgrade(&self.inner);
        EventSubscription::new(move || {
            if let Some(hub) = hub.upgrade() {
                let removed = hub
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                drop(removed);
            }
        })
    }
}
