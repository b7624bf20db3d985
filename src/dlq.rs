//! Dead Letter Queue: terminal channel for messages the pipeline gives up on
//!
//! Messages land here for two reasons: a permanent failure (bad token,
//! missing permission, malformed payload) or too many delivery attempts.
//! Dead letters are kept for manual inspection, never silently dropped.

use crate::error::{Result, SentinelError};
use crate::queue::{QueueMessage, Topic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reason code used when a message exceeds the attempt limit
pub const REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";

/// A dead-lettered message with context about why it ended up here
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The original message
    pub message: QueueMessage,

    /// Reason code (e.g., "token_revoked", "max_attempts_exceeded")
    pub reason: String,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.message.topic
    }
}

/// Trait for dead letter handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Store a dead letter
    ///
    /// An error leaves the message with its queue, leased and redeliverable.
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Remove an inspected dead letter by message id
    async fn remove(&self, message_id: &str) -> Result<Option<DeadLetter>>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Number of dead letters held for one topic
    async fn count_topic(&self, topic: Topic) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ handler with a capacity bound
///
/// A full handler rejects new entries with `Unavailable` instead of evicting
/// old ones; operators make room with [`DlqHandler::remove`].
pub struct MemoryDlqHandler {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
    max_entries: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead_letter: DeadLetter) -> Result<()> {
        let mut entries = self.entries.write().await;
        if self.max_entries > 0 && entries.len() >= self.max_entries {
            tracing::error!(
                message_id = %dead_letter.message.message_id,
                detection_id = %dead_letter.message.detection_id,
                capacity = self.max_entries,
                "Dead letter queue full, message left with its queue"
            );
            return Err(SentinelError::Unavailable(format!(
                "dead letter queue full ({} entries)",
                self.max_entries
            )));
        }
        tracing::warn!(
            message_id = %dead_letter.message.message_id,
            detection_id = %dead_letter.message.detection_id,
            topic = %dead_letter.message.topic,
            attempt_count = dead_letter.message.attempt_count,
            reason = %dead_letter.reason,
            "Message dead-lettered"
        );
        entries.push(dead_letter);
        Ok(())
    }

    async fn remove(&self, message_id: &str) -> Result<Option<DeadLetter>> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .iter()
            .position(|d| d.message.message_id == message_id)
            .map(|idx| entries.remove(idx)))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn count_topic(&self, topic: Topic) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|d| d.topic() == topic)
            .count())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether a delivery attempt exceeds the limit (`0` means unlimited)
pub fn should_dead_letter(attempt_count: u32, max_attempts: u32) -> bool {
    max_attempts > 0 && attempt_count > max_attempts
}
