//! NATS JetStream queue backend
//!
//! Implements `PipelineQueue` on a JetStream stream. Leases map onto the
//! consumer ack wait, so expiry and redelivery happen server-side. Messages
//! over the attempt limit are published to the topic's dead-letter subject
//! and terminated.

mod client;
mod config;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsConfig, StorageType};

use crate::dlq::{should_dead_letter, DeadLetter, DlqHandler, MemoryDlqHandler, REASON_MAX_ATTEMPTS};
use crate::error::{Result, SentinelError};
use crate::queue::{PendingMessage, PipelineQueue, QueueDepth, QueueMessage, Topic};
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

/// NATS JetStream pipeline queue
pub struct NatsQueue {
    client: Arc<NatsClient>,
    dlq: Arc<dyn DlqHandler>,
    max_attempts: u32,
}

impl NatsQueue {
    /// Connect to NATS and initialize the stream
    pub async fn connect(
        config: NatsConfig,
        queue: &crate::config::QueueConfig,
        group: &str,
    ) -> Result<Self> {
        let client = NatsClient::connect(config, group, queue.lease(), queue.max_attempts).await?;
        Ok(Self {
            client: Arc::new(client),
            dlq: Arc::new(MemoryDlqHandler::new(queue.dlq_capacity)),
            max_attempts: queue.max_attempts,
        })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }

    fn pending(&self, msg: jetstream::Message, message: QueueMessage) -> PendingMessage {
        let msg = Arc::new(msg);
        let (msg_ack, msg_nak, msg_dlq) = (msg.clone(), msg.clone(), msg);
        let client = self.client.clone();
        let dlq = self.dlq.clone();
        let dead_copy = message.clone();

        PendingMessage::new(
            message,
            move || {
                async move {
                    msg_ack
                        .ack()
                        .await
                        .map_err(|e| SentinelError::Unavailable(format!("ack failed: {}", e)))
                }
                .boxed()
            },
            move || {
                async move {
                    msg_nak
                        .ack_with(AckKind::Nak(None))
                        .await
                        .map_err(|e| SentinelError::Unavailable(format!("nak failed: {}", e)))
                }
                .boxed()
            },
            move |reason| {
                async move { route_dead_letter(&client, &dlq, &msg_dlq, dead_copy, reason).await }
                    .boxed()
            },
        )
    }
}

/// Publish to the dead-letter subject, record locally, then terminate delivery
async fn route_dead_letter(
    client: &NatsClient,
    dlq: &Arc<dyn DlqHandler>,
    msg: &jetstream::Message,
    message: QueueMessage,
    reason: String,
) -> Result<()> {
    let topic = message.topic;
    let dead_letter = DeadLetter::new(message, reason);
    let payload = Bytes::from(serde_json::to_vec(&dead_letter)?);
    let msg_id = format!("dlq-{}", dead_letter.message.message_id);
    client
        .publish(client.config().dead_letter_subject(topic), &msg_id, payload)
        .await?;
    dlq.handle(dead_letter).await?;

    msg.ack_with(AckKind::Term)
        .await
        .map_err(|e| SentinelError::Unavailable(format!("term failed: {}", e)))
}

#[async_trait]
impl PipelineQueue for NatsQueue {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let subject = self
            .client
            .config()
            .message_subject(message.topic, &message.detection_id);
        let payload = Bytes::from(serde_json::to_vec(&message)?);
        self.client
            .publish(subject, &message.message_id, payload)
            .await
            .map(|_| ())
    }

    async fn claim(&self, topic: Topic, wait: Duration) -> Result<Option<PendingMessage>> {
        let Some(msg) = self.client.fetch_one(topic, wait).await? else {
            return Ok(None);
        };

        let delivered = msg
            .info()
            .map(|info| info.delivered.max(1) as u32)
            .unwrap_or(1);

        let mut message = match serde_json::from_slice::<QueueMessage>(&msg.payload) {
            Ok(message) => message,
            Err(e) => {
                let subject = msg.subject.to_string();
                let key = subject.rsplit('.').next().unwrap_or_default().to_string();
                tracing::warn!(subject = %subject, error = %e, "Undecodable message on queue");
                let raw = QueueMessage::new(
                    topic,
                    key,
                    serde_json::json!({ "raw": String::from_utf8_lossy(&msg.payload) }),
                );
                let reason = "malformed_payload".to_string();
                route_dead_letter(&self.client, &self.dlq, &msg, raw, reason).await?;
                return Ok(None);
            }
        };
        message.attempt_count = delivered;

        if should_dead_letter(delivered, self.max_attempts) {
            let reason = REASON_MAX_ATTEMPTS.to_string();
            route_dead_letter(&self.client, &self.dlq, &msg, message, reason).await?;
            return Ok(None);
        }

        Ok(Some(self.pending(msg, message)))
    }

    async fn requeue_expired(&self) -> Result<usize> {
        // Ack wait expiry is enforced by the server
        Ok(0)
    }

    async fn depth(&self, topic: Topic) -> Result<QueueDepth> {
        let (ready, in_flight) = self.client.consumer_depth(topic).await?;
        let dead_lettered = self.dlq.count_topic(topic).await? as u64;
        Ok(QueueDepth {
            ready,
            in_flight,
            dead_lettered,
        })
    }

    fn dlq(&self) -> Arc<dyn DlqHandler> {
        self.dlq.clone()
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        self.client.stream_info().await.map(|_| true)
    }
}
