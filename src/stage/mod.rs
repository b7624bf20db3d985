//! Pipeline stages and the worker loop that drives them
//!
//! A `Worker` claims messages from one topic and hands each to a
//! `MessageHandler`. The handler's outcome maps onto the lease:
//!
//! - `Ack`: done, or already done (a uniqueness conflict counts as done)
//! - `Retry`: transient failure; released for redelivery, bounded by the
//!   queue's attempt limit
//! - `DeadLetter(reason)`: permanent failure (bad token, missing
//!   permission, malformed payload); never retried
//!
//! Workers share nothing in memory. Coordination happens through the queue
//! lease and the record store's uniqueness constraints.

pub mod alert;
pub mod classification;
pub mod detection;
pub mod feed;

pub use alert::AlertStage;
pub use classification::ClassificationStage;
pub use detection::DetectionStage;
pub use feed::AlertFeed;

use crate::auth::{Identity, TokenAuthority};
use crate::error::{Result, SentinelError};
use crate::queue::{PendingMessage, PipelineQueue, QueueMessage, Topic};
use crate::types::Permission;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What to do with a claimed message after handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
    DeadLetter(String),
}

impl Disposition {
    /// Map a handler error onto the lease
    pub fn from_error(error: &SentinelError) -> Self {
        if error.is_conflict() {
            Disposition::Ack
        } else if error.is_permanent() {
            Disposition::DeadLetter(error.reason_code().to_string())
        } else {
            Disposition::Retry
        }
    }
}

/// Per-message logic of a consuming stage
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Topic this handler consumes
    fn topic(&self) -> Topic;

    fn name(&self) -> &str;

    async fn handle(&self, message: &QueueMessage) -> Result<Disposition>;
}

/// Verify the publisher's propagated token: a valid service token with `write`
pub(crate) async fn verify_publisher(
    authority: &TokenAuthority,
    message: &QueueMessage,
) -> Result<Identity> {
    let token = message.token.as_deref().ok_or_else(|| {
        SentinelError::InvalidToken("message carries no service token".to_string())
    })?;
    let identity = authority.authorize(token, Permission::Write).await?;
    if !identity.is_service() {
        return Err(SentinelError::Forbidden(format!(
            "'{}' is not a service principal",
            identity.subject
        )));
    }
    Ok(identity)
}

/// Claim loop for one handler
pub struct Worker {
    id: String,
    queue: Arc<dyn PipelineQueue>,
    handler: Arc<dyn MessageHandler>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn PipelineQueue>,
        handler: Arc<dyn MessageHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
            poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process at most one message; `Ok(false)` when none arrived
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.claim(self.handler.topic(), self.poll_interval).await? {
            Some(pending) => {
                self.process(pending).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle one claimed message and settle its lease
    pub async fn process(&self, pending: PendingMessage) -> Result<Disposition> {
        let message = &pending.message;
        let disposition = match self.handler.handle(message).await {
            Ok(disposition) => disposition,
            Err(e) => {
                let disposition = Disposition::from_error(&e);
                tracing::warn!(
                    worker = %self.id,
                    detection_id = %message.detection_id,
                    attempt_count = message.attempt_count,
                    error = %e,
                    disposition = ?disposition,
                    "Message handling failed"
                );
                disposition
            }
        };

        match &disposition {
            Disposition::Ack => pending.ack().await?,
            Disposition::Retry => pending.nak().await?,
            Disposition::DeadLetter(reason) => pending.dead_letter(reason.clone()).await?,
        }
        Ok(disposition)
    }

    /// Run until the shutdown signal flips or its sender is dropped
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                worker = %self.id,
                stage = self.handler.name(),
                topic = %self.handler.topic(),
                "Worker started"
            );
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let claimed = tokio::select! {
                    _ = shutdown.changed() => break,
                    claimed = self.queue.claim(self.handler.topic(), self.poll_interval) => {
                        claimed
                    }
                };

                match claimed {
                    Ok(Some(pending)) => match self.process(pending).await {
                        Ok(Disposition::Retry) => tokio::time::sleep(self.poll_interval).await,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(
                                worker = %self.id,
                                error = %e,
                                "Failed to settle message lease"
                            );
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(worker = %self.id, error = %e, "Queue claim failed");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
            tracing::info!(worker = %self.id, "Worker stopped");
        })
    }
}
