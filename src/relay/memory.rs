/**
 * relay/memory.rs
 *
 * In-process pub/sub broker
 */

use super::{Relay, SubscriberTable, SubscriptionCallback, SubscriptionId};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Publishes kept for `published`; older ones are dropped
pub const PUBLISH_LOG_LEN: usize = 1024;

/// Broker that delivers publishes to local subscribers synchronously.
/// Clones share the same topic space. Every publish is also recorded so
/// tests can assert on what was (or was not) sent. Only the last
/// `PUBLISH_LOG_LEN` publishes are kept.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    table: Mutex<SubscriberTable>,
    published: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published on `topic` so far, oldest first
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Topics with at least one live subscription
    pub fn subscribed_topics(&self) -> Vec<String> {
        let table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut topics: Vec<String> = table.topics().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl Relay for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        {
            let mut log = self.inner.published.lock().unwrap_or_else(PoisonError::into_inner);
            if log.len() == PUBLISH_LOG_LEN {
                log.pop_front();
            }
            log.push_back((topic.to_string(), payload.clone()));
        }

        let callbacks = self
            .inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks(topic);
        trace!(topic, subscribers = callbacks.len(), "memory broker publish");

        for callback in callbacks {
            callback(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: SubscriptionCallback) -> Result<SubscriptionId> {
        let mut table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        let (id, _) = table.add(topic, callback);
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<()> {
        let mut table = self.inner.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.remove(topic, id);
        Ok(())
    }
}
