//! In-memory record store

use super::{Acknowledgement, RecordCounts, RecordStore};
use crate::error::{Result, SentinelError};
use crate::types::{Alert, AlertQuery, ClassificationResult, ThreatCategory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    classifications: HashMap<String, ClassificationResult>,
    alerts: HashMap<String, Alert>,
    /// detection_id → alert_id
    alert_index: HashMap<String, String>,
}

/// Record store kept in process memory, for tests and single-node demos
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_classification(&self, result: &ClassificationResult) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.classifications.contains_key(&result.detection_id) {
            return Err(SentinelError::Conflict(format!(
                "classification for {} already exists",
                result.detection_id
            )));
        }
        tables
            .classifications
            .insert(result.detection_id.clone(), result.clone());
        Ok(())
    }

    async fn get_classification(&self, detection_id: &str) -> Result<Option<ClassificationResult>> {
        Ok(self.tables.read().await.classifications.get(detection_id).cloned())
    }

    async fn mark_forwarded(&self, detection_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let result = tables
            .classifications
            .get_mut(detection_id)
            .ok_or_else(|| SentinelError::NotFound(format!("classification {}", detection_id)))?;
        result.forwarded_at.get_or_insert(at);
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.alert_index.contains_key(&alert.detection_id)
            || tables.alerts.contains_key(&alert.alert_id)
        {
            return Err(SentinelError::Conflict(format!(
                "alert for {} already exists",
                alert.detection_id
            )));
        }
        tables
            .alert_index
            .insert(alert.detection_id.clone(), alert.alert_id.clone());
        tables.alerts.insert(alert.alert_id.clone(), alert.clone());
        Ok(())
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        Ok(self.tables.read().await.alerts.get(alert_id).cloned())
    }

    async fn alert_for_detection(&self, detection_id: &str) -> Result<Option<Alert>> {
        let tables = self.tables.read().await;
        Ok(tables
            .alert_index
            .get(detection_id)
            .and_then(|id| tables.alerts.get(id))
            .cloned())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let tables = self.tables.read().await;
        let mut alerts: Vec<Alert> = tables
            .alerts
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts.truncate(query.limit);
        Ok(alerts)
    }

    async fn acknowledge_alert(
        &self,
        alert_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Acknowledgement> {
        let mut tables = self.tables.write().await;
        let alert = tables
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| SentinelError::NotFound(format!("alert {}", alert_id)))?;

        let transitioned = !alert.acknowledged;
        if transitioned {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(actor.to_string());
            alert.acknowledged_at = Some(at);
        }
        Ok(Acknowledgement {
            alert: alert.clone(),
            transitioned,
        })
    }

    async fn counts(&self) -> Result<RecordCounts> {
        let tables = self.tables.read().await;
        let mut counts = RecordCounts {
            classifications: tables.classifications.len() as u64,
            alerts: tables.alerts.len() as u64,
            ..Default::default()
        };
        for alert in tables.alerts.values() {
            match alert.threat_category {
                ThreatCategory::Critical => counts.critical_alerts += 1,
                ThreatCategory::HighThreat => counts.high_threat_alerts += 1,
                _ => {}
            }
            if alert.acknowledged {
                counts.acknowledged_alerts += 1;
            }
        }
        Ok(counts)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
