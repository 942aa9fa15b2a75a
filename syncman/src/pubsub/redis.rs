//! Redis-backed pub/sub.
//!
//! Publishing shares one multiplexed connection. Every subscription gets its
//! own connection, as Redis requires for subscriber mode.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::{config::PubSubConfig, error::SyncResult};

pub struct RedisPubSub {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub").finish_non_exhaustive()
    }
}

impl RedisPubSub {
    pub async fn new(config: &PubSubConfig) -> SyncResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(config = ?config, "Connected to redis pub/sub");
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            conn,
            shutdown,
        })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> SyncResult<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!(topic, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut shutdown = self.shutdown.subscribe();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            tokio::pin!(messages);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    // Dropping the connection unsubscribes the topic.
                    _ = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(topic = %topic, "Redis subscription closed");
                            break;
                        };
                        match msg.get_payload::<Vec<u8>>() {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(topic = %topic, error = %e, "Unable to read message payload"),
                        }
                    }
                }
            }
            debug!(topic = %topic, "Subscription task stopped");
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
