//! Subscription registries.
//!
//! The client keeps one listener per channel key and routes
//! `ServerSubscriptionEvent` messages to it. The server keeps the set of
//! channel keys the peer subscribed to, so publishing to a channel nobody
//! listens on sends nothing.
//!
//! Events for unknown keys are dropped quietly: an event crossing an
//! unsubscribe on the wire is an expected race.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// One event delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub event: String,
    pub payload: Value,
}

/// Receiving end of a channel subscription.
///
/// [`Subscription::recv`] returns `None` once the channel was unsubscribed
/// (from either side) or the connection closed.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Subscription {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Client-side registry: channel key to listener.
#[derive(Default)]
pub struct Subscriptions {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionEvent>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` as active and return its handle. Subscribing again to
    /// the same key replaces the previous listener, whose handle closes.
    pub fn subscribe(&self, key: impl Into<String>) -> Subscription {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(key.clone(), tx);
        Subscription { key, rx }
    }

    /// Remove the listener. Returns `false` if `key` was not subscribed.
    pub fn unsubscribe(&self, key: &str) -> bool {
        self.listeners.lock().remove(key).is_some()
    }

    /// Route an event to its listener. Returns whether it was delivered.
    pub fn deliver(&self, key: &str, event: String, payload: Value) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(listener) = listeners.get(key) else {
            tracing::trace!(channel = key, event = %event, "Discarding event for unknown channel");
            return false;
        };
        if listener.send(SubscriptionEvent { event, payload }).is_err() {
            // Handle dropped without unsubscribing.
            listeners.remove(key);
            return false;
        }
        true
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.listeners.lock().contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Drop every listener without notifying the peer.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

/// Server-side registry: channel keys the peer subscribed to.
#[derive(Default)]
pub struct Channels {
    keys: Mutex<HashSet<String>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the key was already active.
    pub fn subscribe(&self, key: impl Into<String>) -> bool {
        self.keys.lock().insert(key.into())
    }

    /// Returns `false` if the key was not active.
    pub fn unsubscribe(&self, key: &str) -> bool {
        self.keys.lock().remove(key)
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}
