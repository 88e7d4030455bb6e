//! Event infrastructure: a typed bus with drop-to-unsubscribe handles.
//!
//! Each component that fans out notifications owns an `EventBus<E>` over
//! its own event enum. Listener panics are caught and logged; they never
//! abort delivery to the remaining subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::error;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<dyn Unsubscribe + Send + Sync>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

trait Unsubscribe {
    fn unsubscribe(&self, id: usize);
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing typed events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription
    where
        E: Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let bus: Weak<Self> = Arc::downgrade(self);
        let bus: Weak<dyn Unsubscribe + Send + Sync> = bus;
        Subscription { bus, id }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &E) {
        // Clone the callback list so a callback may subscribe/unsubscribe
        // without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("event listener panicked; continuing with remaining listeners");
            }
        }
    }
}

impl<E: Send + Sync + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // try_write avoids deadlock if Drop runs while emit holds the read
        // lock during panic unwinding.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }
}
