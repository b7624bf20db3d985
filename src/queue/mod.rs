//! Pipeline queue: the core abstraction for message backends
//!
//! A durable, at-least-once, per-key-ordered channel with lease semantics:
//! a claimed message is invisible to other consumers until it is acked,
//! nacked, dead-lettered, or its lease expires. An expired lease makes the
//! message claimable again with a higher `attempt_count`; a message claimed
//! more than `max_attempts` times goes to the dead-letter queue.

use crate::dlq::DlqHandler;
use crate::error::{Result, SentinelError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod memory;
pub mod nats;

/// Logical topics of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Detections,
    Classifications,
    Alerts,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Detections, Topic::Classifications, Topic::Alerts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Detections => "detections",
            Topic::Classifications => "classifications",
            Topic::Alerts => "alerts",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Topic::Detections => 0,
            Topic::Classifications => 1,
            Topic::Alerts => 2,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope for every queued message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Unique message identifier (msg-<uuid>), used for publish deduplication
    pub message_id: String,

    pub topic: Topic,

    /// Idempotency and ordering key
    pub detection_id: String,

    pub payload: serde_json::Value,

    pub published_at: DateTime<Utc>,

    /// Delivery attempts so far, maintained by the queue
    #[serde(default)]
    pub attempt_count: u32,

    /// Publisher's service token, propagated for zero-trust checks downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl QueueMessage {
    pub fn new(topic: Topic, detection_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: format!("msg-{}", uuid::Uuid::new_v4()),
            topic,
            detection_id: detection_id.into(),
            payload,
            published_at: Utc::now(),
            attempt_count: 0,
            token: None,
        }
    }

    /// Serialize a record as the payload
    pub fn encode<T: Serialize>(
        topic: Topic,
        detection_id: impl Into<String>,
        record: &T,
    ) -> Result<Self> {
        Ok(Self::new(topic, detection_id, serde_json::to_value(record)?))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Decode the payload into a record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(SentinelError::from)
    }
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type DeadLetterFn = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<()>> + Send>;

/// A claimed message holding a lease
///
/// Exactly one of `ack`, `nak`, or `dead_letter` should be called. Dropping
/// the handle without calling any of them leaves the lease to expire.
pub struct PendingMessage {
    pub message: QueueMessage,

    ack_fn: AckFn,
    nak_fn: AckFn,
    dead_letter_fn: DeadLetterFn,
}

impl PendingMessage {
    pub fn new(
        message: QueueMessage,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        dead_letter_fn: impl FnOnce(String) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
            dead_letter_fn: Box::new(dead_letter_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Release the lease now so the message is redelivered
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }

    /// Route to the dead-letter queue with a reason code
    pub async fn dead_letter(self, reason: impl Into<String>) -> Result<()> {
        (self.dead_letter_fn)(reason.into()).await
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMessage")
            .field("message_id", &self.message.message_id)
            .field("topic", &self.message.topic)
            .field("detection_id", &self.message.detection_id)
            .field("attempt_count", &self.message.attempt_count)
            .finish_non_exhaustive()
    }
}

/// Queue occupancy for one topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// Core trait for queue backends
#[async_trait]
pub trait PipelineQueue: Send + Sync {
    /// Publish a message (at-least-once)
    async fn publish(&self, message: QueueMessage) -> Result<()>;

    /// Claim the next message of a topic, waiting up to `wait`
    ///
    /// Messages over the attempt limit are dead-lettered here instead of
    /// being handed out.
    async fn claim(&self, topic: Topic, wait: Duration) -> Result<Option<PendingMessage>>;

    /// Make messages whose lease has expired claimable again
    ///
    /// Backends with server-side leases return `Ok(0)`.
    async fn requeue_expired(&self) -> Result<usize>;

    async fn depth(&self, topic: Topic) -> Result<QueueDepth>;

    /// Dead-letter channel of this queue
    fn dlq(&self) -> Arc<dyn DlqHandler>;

    /// Backend name (e.g., "memory", "nats")
    fn name(&self) -> &str;

    /// Health check: defaults to a successful depth query
    async fn health(&self) -> Result<bool> {
        self.depth(Topic::Detections).await.map(|_| true)
    }
}

/// Spawn the lease sweeper for backends without native leases
pub fn spawn_sweeper(queue: Arc<dyn PipelineQueue>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match queue.requeue_expired().await {
                Ok(0) => {}
                Ok(requeued) => {
                    tracing::debug!(queue = queue.name(), requeued, "Expired leases requeued")
                }
                Err(e) => tracing::warn!(queue = queue.name(), error = %e, "Lease sweep failed"),
            }
        }
    })
}
