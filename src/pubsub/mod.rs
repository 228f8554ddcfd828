//! Event fan-out primitives.
//!
//! Provides [`Event`] -- a kind-tagged envelope published by the session,
//! message, and permission services -- and [`Broker`], a thin wrapper
//! around a `tokio::sync::broadcast` channel.  Publishers never block:
//! a subscriber that falls behind loses the oldest events and observes a
//! `Lagged` error on its receiver instead of stalling the producer.
//! Consumers must therefore not assume they see every event.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of each service broadcast channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// What happened to the payload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A kind-tagged event envelope.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

/// Per-service broadcast hub.
///
/// Each service owns one `Broker`; every call to [`Broker::subscribe`]
/// returns an independent receiver that sees all events published
/// **after** subscription.
#[derive(Debug)]
pub struct Broker<T> {
    tx: broadcast::Sender<Event<T>>,
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Create a new receiver subscribed to this broker.
    pub fn subscribe(&self) -> broadcast::Receiver<Event<T>> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Best-effort: the event is dropped when nobody is subscribed.
    pub fn publish(&self, kind: EventKind, payload: T) {
        let _ = self.tx.send(Event { kind, payload });
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}
