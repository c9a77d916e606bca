//! Publish/subscribe primitives for observable runtime state.
//!
//! - [`StateStream`] replays the latest value to new subscribers (backed by
//!   `tokio::sync::watch`). Used for session, lifecycle, and link state.
//! - [`EventStream`] is a bounded fan-out of discrete events (backed by
//!   `tokio::sync::broadcast`). A slow subscriber loses the oldest events
//!   first; publishers never block and never fail.

use tokio::sync::{broadcast, watch};

/// Latest-value state cell with change notification.
#[derive(Debug)]
pub struct StateStream<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> StateStream<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the current value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Apply `f` to the current value; subscribers are notified only when
    /// `f` returns true.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Subscribe; the receiver observes the current value immediately.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Default capacity for event streams.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Bounded drop-oldest event fan-out.
#[derive(Debug)]
pub struct EventStream<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for EventStream<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
