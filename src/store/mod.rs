//! Record store: durable home of classification results and alerts
//!
//! Uniqueness on `detection_id` is enforced by the store itself: a second
//! insert for the same detection fails with `Conflict`, which the stages
//! treat as "already done". Acknowledgement is a conditional update, so
//! concurrent acknowledgers agree on a single `acknowledged_at`.

use crate::error::Result;
use crate::types::{Alert, AlertQuery, ClassificationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

mod memory;
mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub(crate) use sqlite::run_blocking;

/// Result of an acknowledge call
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    /// The alert after the call
    pub alert: Alert,

    /// Whether this call performed the open → acknowledged transition
    pub transitioned: bool,
}

/// Row counts held by a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub classifications: u64,
    pub alerts: u64,
    pub critical_alerts: u64,
    pub high_threat_alerts: u64,
    pub acknowledged_alerts: u64,
}

impl RecordCounts {
    /// Alerts not yet acknowledged
    pub fn active_alerts(&self) -> u64 {
        self.alerts.saturating_sub(self.acknowledged_alerts)
    }
}

/// Storage contract for the classification and alert stages
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a classification, `Conflict` if one exists for the detection
    async fn insert_classification(&self, result: &ClassificationResult) -> Result<()>;

    async fn get_classification(&self, detection_id: &str) -> Result<Option<ClassificationResult>>;

    /// Set `forwarded_at` if unset; `NotFound` for an unknown detection
    async fn mark_forwarded(&self, detection_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Insert an alert, `Conflict` if one exists for the detection
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>>;

    async fn alert_for_detection(&self, detection_id: &str) -> Result<Option<Alert>>;

    /// Alerts matching the query, newest first
    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    /// Open → acknowledged if still open; `NotFound` for an unknown id
    async fn acknowledge_alert(
        &self,
        alert_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Acknowledgement>;

    async fn counts(&self) -> Result<RecordCounts>;

    /// Store name (e.g., "memory", "sqlite")
    fn name(&self) -> &str;

    /// Health check: defaults to a successful count query
    async fn health(&self) -> Result<bool> {
        self.counts().await.map(|_| true)
    }
}

/// Behaviour shared by every backend, run from each backend's tests
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::error::SentinelError;
    use crate::types::ThreatCategory;
    use std::collections::BTreeMap;

    pub fn classification(detection_id: &str, score: f64) -> ClassificationResult {
        let mut attributions = BTreeMap::new();
        attributions.insert("person_count".to_string(), 0.4);
        ClassificationResult {
            detection_id: detection_id.to_string(),
            source: "cam-1".to_string(),
            threat_score: score,
            threat_category: ThreatCategory::from_score(score),
            feature_attributions: attributions,
            classified_at: Utc::now(),
            model_version: "rule-based".to_string(),
            forwarded_at: None,
        }
    }

    pub async fn classification_uniqueness(store: &dyn RecordStore) {
        let first = classification("det-1", 0.9);
        store.insert_classification(&first).await.unwrap();

        let err = store
            .insert_classification(&classification("det-1", 0.1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get_classification("det-1").await.unwrap().unwrap();
        assert_eq!(stored.threat_score, 0.9);
        assert_eq!(stored.feature_attributions, first.feature_attributions);
        assert!(store.get_classification("det-2").await.unwrap().is_none());
    }

    pub async fn forwarded_marker(store: &dyn RecordStore) {
        store.insert_classification(&classification("det-1", 0.9)).await.unwrap();

        let first = Utc::now();
        store.mark_forwarded("det-1", first).await.unwrap();
        store
            .mark_forwarded("det-1", first + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let stored = store.get_classification("det-1").await.unwrap().unwrap();
        let forwarded = stored.forwarded_at.unwrap();
        assert_eq!(forwarded.timestamp_micros(), first.timestamp_micros());

        let err = store.mark_forwarded("det-404", first).await.unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));
    }

    pub async fn alert_uniqueness(store: &dyn RecordStore) {
        let c = classification("det-1", 0.9);
        let alert = Alert::open(&c, "two persons");
        store.insert_alert(&alert).await.unwrap();

        let err = store.insert_alert(&Alert::open(&c, "again")).await.unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(
            store.alert_for_detection("det-1").await.unwrap().unwrap().alert_id,
            alert.alert_id
        );
        assert_eq!(store.counts().await.unwrap().alerts, 1);
    }

    pub async fn acknowledge_once(store: &dyn RecordStore) {
        let alert = Alert::open(&classification("det-1", 0.9), "x");
        store.insert_alert(&alert).await.unwrap();

        let first_at = Utc::now();
        let first = store
            .acknowledge_alert(&alert.alert_id, "operator", first_at)
            .await
            .unwrap();
        assert!(first.transitioned);
        assert!(first.alert.acknowledged);
        assert_eq!(first.alert.acknowledged_by.as_deref(), Some("operator"));

        let second = store
            .acknowledge_alert(&alert.alert_id, "admin", first_at + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(!second.transitioned);
        assert_eq!(second.alert.acknowledged_by.as_deref(), Some("operator"));
        assert_eq!(
            second.alert.acknowledged_at.unwrap().timestamp_micros(),
            first_at.timestamp_micros()
        );

        let err = store
            .acknowledge_alert("alert-404", "operator", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.acknowledged_alerts, 1);
        assert_eq!(counts.active_alerts(), 0);
    }

    pub async fn list_filters(store: &dyn RecordStore) {
        let base = Utc::now();
        for (i, score) in [0.95, 0.7, 0.85].iter().enumerate() {
            let mut alert = Alert::open(&classification(&format!("det-{}", i), *score), "x");
            alert.created_at = base + chrono::Duration::seconds(i as i64);
            store.insert_alert(&alert).await.unwrap();
        }

        let all = store.list_alerts(&AlertQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].detection_id, "det-2");
        assert_eq!(all[2].detection_id, "det-0");

        let critical = store
            .list_alerts(&AlertQuery {
                category: Some(ThreatCategory::Critical),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(critical.len(), 2);

        let window = store
            .list_alerts(&AlertQuery {
                since: Some(base + chrono::Duration::seconds(1)),
                until: Some(base + chrono::Duration::seconds(2)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].detection_id, "det-1");

        store
            .acknowledge_alert(&all[0].alert_id, "operator", Utc::now())
            .await
            .unwrap();
        let open = store
            .list_alerts(&AlertQuery {
                acknowledged: Some(false),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].detection_id, "det-1");

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.alerts, 3);
        assert_eq!(counts.critical_alerts, 2);
        assert_eq!(counts.high_threat_alerts, 1);
        assert_eq!(counts.active_alerts(), 2);
    }
}
