//! Communication bus for in-process pub/sub.
//!
//! Every channel in the runtime is an [`EventBus`]:
//!   - one per service type (property changes, see [`Change`])
//!   - the container broadcast channel (free-form [`Message`]s)
//!   - the container updates channel (every reactive change, see [`Update`])
//!
//! Dispatch is synchronous and ordered. Listeners are called over a snapshot
//! taken when dispatch starts, so listeners attached or detached while a
//! dispatch is running only affect later dispatches. A panicking listener is
//! logged and skipped; the remaining listeners still receive the event.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::types::ServiceId;

// =============================================================================
// Event Types
// =============================================================================

/// Payload carried by the container broadcast channel.
pub type Message = serde_json::Value;

/// Property change on a service's own channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub key: String,
    pub value: serde_json::Value,
}

/// Property change reported on the container-wide updates channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub service: ServiceId,
    pub key: String,
    pub value: serde_json::Value,
}

// =============================================================================
// Listener Management
// =============================================================================

/// Listener callback. Identity (for [`EventBus::detach`]) is the `Arc` allocation.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::listen`].
///
/// Collaborators must call [`Subscription::unsubscribe`] once during their own
/// teardown. Dropping the handle does not unsubscribe.
pub struct Subscription<E> {
    bus: Weak<BusInner<E>>,
    listener: Listener<E>,
}

impl<E> Subscription<E> {
    /// Remove the listener from its bus. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.listener);
        }
    }

    /// The listener this handle refers to.
    pub fn listener(&self) -> &Listener<E> {
        &self.listener
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &(self.bus.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// EventBus
// =============================================================================

struct BusInner<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    stats: Mutex<BusStats>,
}

impl<E> BusInner<E> {
    fn remove(&self, listener: &Listener<E>) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(idx) = listeners.iter().position(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };
        listeners.remove(idx);
        self.stats.lock().active_listeners = listeners.len();
        true
    }
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_dispatched: u64,
    pub listener_panics: u64,
    pub active_listeners: usize,
}

/// Ordered, synchronous event bus. Cloning shares the listener list.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> EventBus<E> {
    /// Create a new bus with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                stats: Mutex::new(BusStats::default()),
            }),
        }
    }

    /// Register a callback. Returns the handle used to unsubscribe.
    pub fn listen<F>(&self, callback: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.attach(Arc::new(callback))
    }

    /// Register an already shared listener, keeping its identity for
    /// [`EventBus::detach`].
    pub fn attach(&self, listener: Listener<E>) -> Subscription<E> {
        let mut listeners = self.inner.listeners.lock();
        listeners.push(Arc::clone(&listener));
        self.inner.stats.lock().active_listeners = listeners.len();
        Subscription {
            bus: Arc::downgrade(&self.inner),
            listener,
        }
    }

    /// Remove the first registration of `listener`. Returns false if it was not attached.
    pub fn detach(&self, listener: &Listener<E>) -> bool {
        self.inner.remove(listener)
    }

    /// Deliver `event` to every listener present when dispatch starts, in
    /// subscription order. Returns the number of listeners that completed.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = self.inner.listeners.lock().clone();

        let mut delivered = 0;
        let mut panics = 0;
        for listener in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    panics += 1;
                    tracing::error!("event listener panicked; continuing with remaining listeners");
                }
            }
        }

        let mut stats = self.inner.stats.lock();
        stats.events_dispatched += 1;
        stats.listener_panics += panics;
        drop(stats);

        tracing::trace!("dispatched event to {} of {} listeners", delivered, snapshot.len());
        delivered
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Get current bus statistics.
    pub fn stats(&self) -> BusStats {
        self.inner.stats.lock().clone()
    }

    /// Whether two handles refer to the same bus.
    pub fn same_bus(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
