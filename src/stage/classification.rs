//! Classification stage: scores detections exactly once per `detection_id`
//!
//! Per message: verify the publisher's token, skip if a result already
//! exists, score, persist under the store's uniqueness constraint, forward
//! qualifying results to the alert stage, then ack. A result that qualified
//! but was never marked forwarded (crash between persist and publish) is
//! forwarded when the detection is redelivered.

use super::{verify_publisher, Disposition, MessageHandler};
use crate::auth::{ServiceCredential, TokenAuthority};
use crate::error::{Result, SentinelError};
use crate::model::{ThreatFeatures, ThreatScorer};
use crate::queue::{PipelineQueue, QueueMessage, Topic};
use crate::stats::ClassificationCounters;
use crate::store::RecordStore;
use crate::types::{ClassificationResult, DetectionEvent, Permission, ThreatCategory};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

pub struct ClassificationStage {
    authority: Arc<TokenAuthority>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn PipelineQueue>,
    scorer: Arc<dyn ThreatScorer>,
    credential: Arc<ServiceCredential>,
    counters: Arc<ClassificationCounters>,
    alert_threshold: f64,
}

impl ClassificationStage {
    pub fn new(
        authority: Arc<TokenAuthority>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn PipelineQueue>,
        scorer: Arc<dyn ThreatScorer>,
        credential: Arc<ServiceCredential>,
        alert_threshold: f64,
    ) -> Self {
        Self {
            authority,
            store,
            queue,
            scorer,
            credential,
            counters: Arc::new(ClassificationCounters::new()),
            alert_threshold,
        }
    }

    pub fn counters(&self) -> Arc<ClassificationCounters> {
        self.counters.clone()
    }

    /// Stored classification of a detection
    pub async fn classification(&self, detection_id: &str) -> Result<ClassificationResult> {
        self.store
            .get_classification(detection_id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("classification {}", detection_id)))
    }

    /// Same as [`classification`](Self::classification), for a bearer with `read`
    pub async fn classification_as(
        &self,
        token: &str,
        detection_id: &str,
    ) -> Result<ClassificationResult> {
        self.authority.authorize(token, Permission::Read).await?;
        self.classification(detection_id).await
    }

    async fn classify(&self, message: &QueueMessage) -> Result<Disposition> {
        let publisher = verify_publisher(&self.authority, message).await?;
        let event: DetectionEvent = message.decode()?;
        if event.detection_id != message.detection_id {
            return Err(SentinelError::Serialization(serde::de::Error::custom(format!(
                "payload detection {} does not match key {}",
                event.detection_id, message.detection_id
            ))));
        }

        if let Some(existing) = self.store.get_classification(&event.detection_id).await? {
            tracing::debug!(
                detection_id = %event.detection_id,
                attempt_count = message.attempt_count,
                "Detection already classified"
            );
            self.counters.record_duplicate();
            return self.forward_if_pending(&existing).await;
        }

        let features = ThreatFeatures::extract(&event);
        let score = self.scorer.score(&features).await?;
        let result = ClassificationResult {
            detection_id: event.detection_id.clone(),
            source: event.source.clone(),
            threat_score: score.threat_score,
            threat_category: ThreatCategory::from_score(score.threat_score),
            feature_attributions: score.feature_attributions,
            classified_at: Utc::now(),
            model_version: score.model_version,
            forwarded_at: None,
        };

        match self.store.insert_classification(&result).await {
            Ok(()) => {
                self.counters.record_classification(
                    result.threat_score,
                    result.threat_category,
                    score.fallback,
                    result.classified_at,
                );
                tracing::info!(
                    detection_id = %result.detection_id,
                    publisher = %publisher.subject,
                    threat_score = result.threat_score,
                    threat_category = %result.threat_category,
                    model_version = %result.model_version,
                    "Detection classified"
                );
                self.forward_if_pending(&result).await
            }
            Err(e) if e.is_conflict() => {
                // Lost a race with a redelivered copy; the winner's row stands
                self.counters.record_duplicate();
                let existing = self.classification(&result.detection_id).await?;
                self.forward_if_pending(&existing).await
            }
            Err(e) => Err(e),
        }
    }

    async fn forward_if_pending(&self, result: &ClassificationResult) -> Result<Disposition> {
        if result.threat_score < self.alert_threshold || result.forwarded_at.is_some() {
            return Ok(Disposition::Ack);
        }

        let bearer = self.credential.bearer().await?;
        let message = QueueMessage::encode(Topic::Classifications, &result.detection_id, result)?
            .with_token(bearer);
        self.queue.publish(message).await?;
        self.store.mark_forwarded(&result.detection_id, Utc::now()).await?;
        self.counters.record_forwarded();

        tracing::debug!(
            detection_id = %result.detection_id,
            threat_score = result.threat_score,
            "Classification forwarded for alerting"
        );
        Ok(Disposition::Ack)
    }
}

#[async_trait]
impl MessageHandler for ClassificationStage {
    fn topic(&self) -> Topic {
        Topic::Detections
    }

    fn name(&self) -> &str {
        "classification"
    }

    async fn handle(&self, message: &QueueMessage) -> Result<Disposition> {
        let outcome = self.classify(message).await;
        if let Err(e) = &outcome {
            if e.is_permanent() {
                self.counters.record_rejected();
            }
        }
        outcome
    }
}
