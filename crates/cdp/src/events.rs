//! Event plumbing
//!
//! Two flavours:
//! - `EventEmitter`: synchronous callbacks, invoked in order on the message
//!   loop. Used for everything that mutates state or resolves waiters.
//! - `EventBus`: tokio broadcast channel for external observers that can
//!   afford to lag.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event subscriber callback
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

type Listeners<E> = Arc<Mutex<Vec<(u64, EventCallback<E>)>>>;

/// Synchronous, ordered fan-out to registered callbacks
pub struct EventEmitter<E> {
    listeners: Listeners<E>,
    next_id: AtomicU64,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; dropping the returned handle unregisters it
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|(other, _)| *other != id);
            }
        })
    }

    /// Invoke every callback registered at the time of the call
    ///
    /// The lock is not held while callbacks run, so they may subscribe or
    /// unsubscribe freely.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<EventCallback<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration handle
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now
    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Simple event bus using tokio broadcast channel
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event
    pub fn publish(&self, event: E) {
        let _ = self.tx.send(event); // Ignore error if no subscribers
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
