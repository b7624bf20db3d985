//! NATS JetStream client: connect, publish, pull with durable consumers

use super::config::{NatsConfig, StorageType};
use crate::error::{Result, SentinelError};
use crate::queue::Topic;
use async_nats::jetstream;
use async_nats::jetstream::consumer::PullConsumer;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shortest fetch expiry sent to the server
const MIN_FETCH_EXPIRY: Duration = Duration::from_millis(50);

/// NATS JetStream client
///
/// Manages the connection, the stream, and one durable pull consumer per
/// topic. Consumers are created lazily and cached.
pub struct NatsClient {
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    consumers: Mutex<HashMap<Topic, PullConsumer>>,

    config: Arc<NatsConfig>,

    /// Durable consumer group name
    group: String,

    /// Lease length, used as the consumer ack wait
    ack_wait: Duration,

    /// Server-side delivery cap (0 = unlimited)
    max_deliver: i64,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(
        config: NatsConfig,
        group: impl Into<String>,
        ack_wait: Duration,
        max_attempts: u32,
    ) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| SentinelError::Unavailable(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client);
        let stream = ensure_stream(&jetstream, &config).await?;

        // One extra delivery lets the client observe the overflow and dead-letter it
        let max_deliver = if max_attempts == 0 {
            0
        } else {
            i64::from(max_attempts) + 1
        };

        Ok(Self {
            jetstream,
            stream: Mutex::new(stream),
            consumers: Mutex::new(HashMap::new()),
            config: Arc::new(config),
            group: group.into(),
            ack_wait,
            max_deliver,
        })
    }

    /// Publish a payload with a dedup id, returning the stream sequence
    pub async fn publish(&self, subject: String, msg_id: &str, payload: Bytes) -> Result<u64> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", msg_id);

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload)
            .await
            .map_err(|e| SentinelError::Unavailable(format!("publish to '{}': {}", subject, e)))?;

        let ack = tokio::time::timeout(Duration::from_secs(self.config.request_timeout_secs), ack)
            .await
            .map_err(|_| {
                SentinelError::Timeout(format!(
                    "publish ack timed out after {}s for subject '{}'",
                    self.config.request_timeout_secs, subject
                ))
            })?
            .map_err(|e| {
                SentinelError::Unavailable(format!("publish ack for '{}': {}", subject, e))
            })?;

        tracing::debug!(subject = %subject, msg_id, sequence = ack.sequence, "Message published");
        Ok(ack.sequence)
    }

    /// Durable pull consumer of a topic, created on first use
    pub async fn consumer(&self, topic: Topic) -> Result<PullConsumer> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&topic) {
            return Ok(consumer.clone());
        }

        let name = self.config.consumer_name(&self.group, topic);
        let filter = self.config.topic_filter(topic);
        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: filter.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    max_deliver: self.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                SentinelError::Unavailable(format!(
                    "failed to create durable consumer '{}': {}",
                    name, e
                ))
            })?;

        tracing::info!(
            consumer = %name,
            filter = %filter,
            ack_wait_ms = self.ack_wait.as_millis() as u64,
            max_deliver = self.max_deliver,
            "Durable consumer ready"
        );

        consumers.insert(topic, consumer.clone());
        Ok(consumer)
    }

    /// Pull at most one message, waiting up to `wait`
    pub async fn fetch_one(
        &self,
        topic: Topic,
        wait: Duration,
    ) -> Result<Option<jetstream::Message>> {
        let consumer = self.consumer(topic).await?;
        let batch = consumer
            .fetch()
            .max_messages(1)
            .expires(wait.max(MIN_FETCH_EXPIRY))
            .messages()
            .await
            .map_err(|e| SentinelError::Unavailable(format!("fetch from '{}': {}", topic, e)))?;

        let mut batch = std::pin::pin!(batch);
        match batch.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(SentinelError::Unavailable(format!(
                "fetch from '{}': {}",
                topic, e
            ))),
            None => Ok(None),
        }
    }

    /// Pending and unacknowledged counts of a topic's consumer
    pub async fn consumer_depth(&self, topic: Topic) -> Result<(u64, u64)> {
        let mut consumer = self.consumer(topic).await?;
        let info = consumer
            .info()
            .await
            .map_err(|e| {
                SentinelError::Unavailable(format!("consumer info for '{}': {}", topic, e))
            })?;
        Ok((info.num_pending, info.num_ack_pending as u64))
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| SentinelError::Unavailable(format!("failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub consumer_count: usize,
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the correct configuration
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        SentinelError::Unavailable(format!(
            "failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}
