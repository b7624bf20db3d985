//! Alert stage: raises at most one alert per detection and serves the
//! operator-facing alert queries

use super::{verify_publisher, Disposition, MessageHandler};
use crate::auth::{ServiceCredential, TokenAuthority};
use crate::error::{Result, SentinelError};
use crate::queue::{PipelineQueue, QueueMessage, Topic};
use crate::stats::AlertCounters;
use crate::store::RecordStore;
use crate::types::{Alert, AlertQuery, ClassificationResult, Permission, ThreatCategory};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;

/// Factors listed in an alert explanation
const EXPLANATION_FACTORS: usize = 3;

pub struct AlertStage {
    authority: Arc<TokenAuthority>,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn PipelineQueue>,
    credential: Arc<ServiceCredential>,
    counters: Arc<AlertCounters>,
    alert_threshold: f64,
}

impl AlertStage {
    pub fn new(
        authority: Arc<TokenAuthority>,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn PipelineQueue>,
        credential: Arc<ServiceCredential>,
        alert_threshold: f64,
    ) -> Self {
        Self {
            authority,
            store,
            queue,
            credential,
            counters: Arc::new(AlertCounters::new()),
            alert_threshold,
        }
    }

    pub fn counters(&self) -> Arc<AlertCounters> {
        self.counters.clone()
    }

    /// Acknowledge an alert on behalf of `actor`
    ///
    /// Idempotent: acknowledging twice returns the alert with the original
    /// `acknowledged_at` and `acknowledged_by`.
    pub async fn acknowledge(&self, alert_id: &str, actor: &str) -> Result<Alert> {
        let ack = self.store.acknowledge_alert(alert_id, actor, Utc::now()).await?;
        if ack.transitioned {
            self.counters.record_acknowledged();
            tracing::info!(alert_id, actor, "Alert acknowledged");
        } else {
            tracing::debug!(alert_id, actor, "Alert already acknowledged");
        }
        Ok(ack.alert)
    }

    pub async fn get_alert(&self, alert_id: &str) -> Result<Alert> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("alert {}", alert_id)))
    }

    pub async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        self.store.list_alerts(query).await
    }

    /// Most recent alerts, newest first
    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.store
            .list_alerts(&AlertQuery {
                limit,
                ..Default::default()
            })
            .await
    }

    /// Acknowledge as the bearer's subject; requires `write`
    pub async fn acknowledge_as(&self, token: &str, alert_id: &str) -> Result<Alert> {
        let identity = self.authority.authorize(token, Permission::Write).await?;
        self.acknowledge(alert_id, &identity.subject).await
    }

    pub async fn get_alert_as(&self, token: &str, alert_id: &str) -> Result<Alert> {
        self.authority.authorize(token, Permission::Read).await?;
        self.get_alert(alert_id).await
    }

    pub async fn list_alerts_as(&self, token: &str, query: &AlertQuery) -> Result<Vec<Alert>> {
        self.authority.authorize(token, Permission::Read).await?;
        self.list_alerts(query).await
    }

    pub async fn recent_alerts_as(&self, token: &str, limit: usize) -> Result<Vec<Alert>> {
        self.authority.authorize(token, Permission::Read).await?;
        self.recent_alerts(limit).await
    }

    async fn raise(&self, message: &QueueMessage) -> Result<Disposition> {
        let publisher = verify_publisher(&self.authority, message).await?;
        let result: ClassificationResult = message.decode()?;

        if result.threat_score < self.alert_threshold {
            tracing::warn!(
                detection_id = %result.detection_id,
                threat_score = result.threat_score,
                threshold = self.alert_threshold,
                "Classification below alert threshold, ignoring"
            );
            return Ok(Disposition::Ack);
        }

        if self.store.alert_for_detection(&result.detection_id).await?.is_some() {
            self.counters.record_duplicate();
            return Ok(Disposition::Ack);
        }

        let alert = Alert::open(&result, explain(&result));
        match self.store.insert_alert(&alert).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                self.counters.record_duplicate();
                return Ok(Disposition::Ack);
            }
            Err(e) => return Err(e),
        }
        self.counters.record_alert(alert.threat_category, alert.created_at);

        tracing::warn!(
            alert_id = %alert.alert_id,
            detection_id = %alert.detection_id,
            publisher = %publisher.subject,
            threat_score = alert.threat_score,
            threat_category = %alert.threat_category,
            "Alert raised"
        );

        // The stored alert is authoritative; the notification feed is best effort
        if let Err(e) = self.notify(&alert).await {
            tracing::warn!(
                alert_id = %alert.alert_id,
                error = %e,
                "Failed to publish alert notification"
            );
        }
        Ok(Disposition::Ack)
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let bearer = self.credential.bearer().await?;
        let message =
            QueueMessage::encode(Topic::Alerts, &alert.detection_id, alert)?.with_token(bearer);
        self.queue.publish(message).await
    }
}

#[async_trait]
impl MessageHandler for AlertStage {
    fn topic(&self) -> Topic {
        Topic::Classifications
    }

    fn name(&self) -> &str {
        "alert"
    }

    async fn handle(&self, message: &QueueMessage) -> Result<Disposition> {
        let outcome = self.raise(message).await;
        if let Err(e) = &outcome {
            if e.is_permanent() {
                self.counters.record_rejected();
            }
        }
        outcome
    }
}

/// Human-readable summary of a classification
///
/// Lists the strongest non-zero feature attributions, e.g.
/// `Critical threat detected (85% threat probability): average confidence 0.29, person count 0.20`.
pub fn explain(result: &ClassificationResult) -> String {
    let label = match result.threat_category {
        ThreatCategory::Critical => "Critical threat detected",
        ThreatCategory::HighThreat => "High threat detected",
        ThreatCategory::Suspicious => "Suspicious activity",
        ThreatCategory::Benign => "Low threat",
    };
    let headline = format!("{} ({:.0}% threat probability)", label, result.threat_score * 100.0);

    let mut factors: Vec<(&String, f64)> = result
        .feature_attributions
        .iter()
        .map(|(name, value)| (name, *value))
        .filter(|(_, value)| *value > 0.0)
        .collect();
    factors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    if factors.is_empty() {
        return format!("{}, model {}", headline, result.model_version);
    }

    let factors: Vec<String> = factors
        .into_iter()
        .take(EXPLANATION_FACTORS)
        .map(|(name, value)| format!("{} {:.2}", name.replace('_', " "), value))
        .collect();
    format!("{}: {}", headline, factors.join(", "))
}
