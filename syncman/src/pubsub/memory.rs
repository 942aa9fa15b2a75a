//! Process-local pub/sub bus.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::SyncResult;

/// Fan-out bus for a single process. Used by single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Topics currently held by the bus, including ones not yet pruned.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

fn prune(topics: &mut HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>) {
    topics.retain(|_, subs| {
        subs.retain(|s| !s.is_closed());
        !subs.is_empty()
    });
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> SyncResult<()> {
        let subscribers = {
            let mut topics = self.topics.lock();
            let Some(subs) = topics.get_mut(topic) else {
                return Ok(());
            };
            subs.retain(|s| !s.is_closed());
            let live = subs.clone();
            if live.is_empty() {
                topics.remove(topic);
            }
            live
        };
        for sub in subscribers {
            // A subscriber dropped mid-publish is pruned on the next call.
            let _ = sub.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut topics = self.topics.lock();
        prune(&mut topics);
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
