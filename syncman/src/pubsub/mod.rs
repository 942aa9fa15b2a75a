//! Leader-gated license control channel.
//!
//! Every node subscribes to one topic per license operation, keyed by its
//! node id. A command arrives wrapped in an [`Envelope`] naming a reply
//! topic; the node answers with an [`Ack`]. Only the cluster leader runs the
//! command, every other node acks negatively. This is request/ack over
//! pub/sub, not a queue: a sender that gets no ack has to retry.

mod memory;
mod redis;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::{memory::MemoryPubSub, redis::RedisPubSub};
use crate::{
    error::{SyncError, SyncResult},
    metrics::SyncMetrics,
};

pub(crate) const SUBSCRIPTION_BUFFER: usize = 64;

/// Namespace shared by every control channel topic.
pub const TOPIC_NAMESPACE: &str = "license-manager";

/// How long a node may take to answer one command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

pub type Subscription = mpsc::Receiver<Vec<u8>>;

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> SyncResult<()>;

    /// Messages published to `topic` after this call returns.
    async fn subscribe(&self, topic: &str) -> SyncResult<Subscription>;

    async fn close(&self) {}
}

/// Answers whether this node currently leads the cluster.
#[async_trait]
pub trait LeaderElector: Send + Sync + 'static {
    async fn check_leader(&self) -> SyncResult<bool>;
}

/// Executes license commands on the leader.
#[async_trait]
pub trait LicenseHandler: Send + Sync + 'static {
    async fn upgrade(&self, payload: Value) -> SyncResult<()>;

    async fn renew(&self, payload: Value) -> SyncResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LicenseOperation {
    Upgrade,
    Renew,
}

impl LicenseOperation {
    pub const ALL: [LicenseOperation; 2] = [LicenseOperation::Upgrade, LicenseOperation::Renew];

    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseOperation::Upgrade => "upgrade",
            LicenseOperation::Renew => "renew",
        }
    }
}

impl fmt::Display for LicenseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic a node listens on for `op` commands.
pub fn generate_pubsub_topic(node_id: &str, op: LicenseOperation) -> String {
    format!("{TOPIC_NAMESPACE}-{node_id}-{op}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub reply_to: String,
    /// Embedded JSON command.
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Control channel
// ============================================================================

struct CommandContext {
    node_id: String,
    pubsub: Arc<dyn PubSub>,
    leader: Arc<dyn LeaderElector>,
    handler: Arc<dyn LicenseHandler>,
    timeout: Duration,
}

impl CommandContext {
    async fn execute(&self, op: LicenseOperation, payload: &str) -> SyncResult<()> {
        if !self.leader.check_leader().await? {
            return Err(SyncError::NotLeader(self.node_id.clone()));
        }
        let payload = if payload.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(payload)?
        };
        match op {
            LicenseOperation::Upgrade => self.handler.upgrade(payload).await,
            LicenseOperation::Renew => self.handler.renew(payload).await,
        }
    }

    async fn handle_message(&self, op: LicenseOperation, raw: Vec<u8>) {
        let envelope: Envelope = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(operation = op.as_str(), error = %e, "Unable to decode command envelope");
                SyncMetrics::record_pubsub_command(op.as_str(), "invalid");
                return;
            }
        };

        let result = tokio::time::timeout(self.timeout, self.execute(op, &envelope.payload))
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::Timeout(format!(
                    "{op} command did not finish within {:?}",
                    self.timeout
                )))
            });

        let (ack, outcome) = match &result {
            Ok(()) => (Ack::ok(), "success"),
            Err(e @ SyncError::NotLeader(_)) => {
                debug!(operation = op.as_str(), "Not the leader, rejecting command");
                (Ack::error(e.to_string()), "not_leader")
            }
            Err(e) => {
                warn!(operation = op.as_str(), error = %e, "License command failed");
                (Ack::error(e.to_string()), "error")
            }
        };
        SyncMetrics::record_pubsub_command(op.as_str(), outcome);

        if envelope.reply_to.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(&ack) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Unable to encode ack");
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(&envelope.reply_to, body).await {
            warn!(reply_to = %envelope.reply_to, error = %e, "Unable to send ack");
        }
    }
}

pub struct ControlChannel {
    ctx: Arc<CommandContext>,
    shutdown: watch::Sender<bool>,
}

impl ControlChannel {
    pub fn new(
        node_id: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        leader: Arc<dyn LeaderElector>,
        handler: Arc<dyn LicenseHandler>,
    ) -> Self {
        Self::with_timeout(node_id, pubsub, leader, handler, COMMAND_TIMEOUT)
    }

    pub fn with_timeout(
        node_id: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        leader: Arc<dyn LeaderElector>,
        handler: Arc<dyn LicenseHandler>,
        timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(CommandContext {
                node_id: node_id.into(),
                pubsub,
                leader,
                handler,
                timeout,
            }),
            shutdown,
        }
    }

    /// Subscribe to this node's command topics.
    pub async fn start(&self) -> SyncResult<()> {
        for op in LicenseOperation::ALL {
            let topic = generate_pubsub_topic(&self.ctx.node_id, op);
            let mut commands = self.ctx.pubsub.subscribe(&topic).await?;
            let mut shutdown = self.shutdown.subscribe();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                loop {
                    let raw = tokio::select! {
                        _ = shutdown.changed() => break,
                        raw = commands.recv() => match raw {
                            Some(raw) => raw,
                            None => break,
                        },
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move { ctx.handle_message(op, raw).await });
                }
                debug!(topic = %topic, "Control channel listener stopped");
            });
            info!(topic = %generate_pubsub_topic(&self.ctx.node_id, op), "Listening for license commands");
        }
        Ok(())
    }

    /// Send `op` to `target_node` and wait for its ack.
    ///
    /// A negative ack comes back as [`SyncError::PubSub`] carrying the remote error.
    pub async fn send_command(
        &self,
        target_node: &str,
        op: LicenseOperation,
        payload: &Value,
        timeout: Duration,
    ) -> SyncResult<()> {
        let reply_to = format!("{TOPIC_NAMESPACE}-reply-{}", Uuid::new_v4());
        let mut replies = self.ctx.pubsub.subscribe(&reply_to).await?;

        let envelope = Envelope {
            reply_to: reply_to.clone(),
            payload: serde_json::to_string(payload)?,
        };
        self.ctx
            .pubsub
            .publish(
                &generate_pubsub_topic(target_node, op),
                serde_json::to_vec(&envelope)?,
            )
            .await?;

        let raw = tokio::time::timeout(timeout, replies.recv())
            .await
            .map_err(|_| SyncError::Timeout(format!("no ack from {target_node} for {op}")))?
            .ok_or_else(|| SyncError::PubSub(format!("reply topic {reply_to} closed")))?;
        let ack: Ack = serde_json::from_slice(&raw)?;
        if ack.ok {
            Ok(())
        } else {
            Err(SyncError::PubSub(ack.error.unwrap_or_default()))
        }
    }

    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.ctx.pubsub.close().await;
    }
}
