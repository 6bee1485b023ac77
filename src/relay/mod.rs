/**
 * relay/mod.rs
 *
 * Pub/sub relay used for rendezvous:
 * - Relay trait consumed by the dialer and listener
 * - In-process broker
 * - TLS WebSocket client
 */

mod memory;
mod websocket;

pub use memory::MemoryBroker;
pub use websocket::{RelayMessage, WebSocketRelay};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Invoked with the raw payload of every message published on a subscribed topic.
/// Must not block: hand the payload off to a task or channel.
pub type SubscriptionCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Control-plane message relay. No ordering or at-most-once delivery is assumed.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str, callback: SubscriptionCallback) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<()>;
}

/// Topic -> subscriber callbacks, shared by the relay implementations
#[derive(Default)]
pub(crate) struct SubscriberTable {
    next_id: u64,
    topics: HashMap<String, Vec<(SubscriptionId, SubscriptionCallback)>>,
}

impl SubscriberTable {
    /// Returns the new id and whether this is the topic's first subscriber
    pub(crate) fn add(&mut self, topic: &str, callback: SubscriptionCallback) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        subscribers.push((id, callback));
        (id, subscribers.len() == 1)
    }

    /// Returns true when the topic has no subscribers left
    pub(crate) fn remove(&mut self, topic: &str, id: SubscriptionId) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed && !self.topics.contains_key(topic)
    }

    /// Snapshot of callbacks so they can run without holding the table lock
    pub(crate) fn callbacks(&self, topic: &str) -> Vec<SubscriptionCallback> {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn topics(&self) -> impl Iterator<Item = &String> {
        self.topics.keys()
    }
}
