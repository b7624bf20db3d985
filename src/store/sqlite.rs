//! SQLite record store
//!
//! Uniqueness comes from table constraints (`detection_id` is the primary key
//! of `classifications` and UNIQUE in `alerts`). Calls run on the blocking
//! pool against one shared connection.

use super::{Acknowledgement, RecordCounts, RecordStore};
use crate::error::{Result, SentinelError};
use crate::types::{Alert, AlertQuery, ClassificationResult, ThreatCategory};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS classifications (
    detection_id         TEXT PRIMARY KEY,
    source               TEXT NOT NULL,
    threat_score         REAL NOT NULL,
    threat_category      TEXT NOT NULL,
    feature_attributions TEXT NOT NULL,
    classified_at        TEXT NOT NULL,
    model_version        TEXT NOT NULL,
    forwarded_at         TEXT
);
CREATE TABLE IF NOT EXISTS alerts (
    alert_id        TEXT PRIMARY KEY,
    detection_id    TEXT NOT NULL UNIQUE,
    threat_score    REAL NOT NULL,
    threat_category TEXT NOT NULL,
    explanation     TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    acknowledged    INTEGER NOT NULL DEFAULT 0,
    acknowledged_by TEXT,
    acknowledged_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts (created_at);
";

const ALERT_COLUMNS: &str = "alert_id, detection_id, threat_score, threat_category, explanation, \
     created_at, acknowledged, acknowledged_by, acknowledged_at";

const CLASSIFICATION_COLUMNS: &str = "detection_id, source, threat_score, threat_category, \
     feature_attributions, classified_at, model_version, forwarded_at";

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SentinelError::Unavailable(format!("bad timestamp '{}' in store: {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Alert row as stored, before text columns are parsed
struct AlertRow {
    alert_id: String,
    detection_id: String,
    threat_score: f64,
    threat_category: String,
    explanation: String,
    created_at: String,
    acknowledged: bool,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<String>,
}

impl AlertRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            alert_id: row.get(0)?,
            detection_id: row.get(1)?,
            threat_score: row.get(2)?,
            threat_category: row.get(3)?,
            explanation: row.get(4)?,
            created_at: row.get(5)?,
            acknowledged: row.get(6)?,
            acknowledged_by: row.get(7)?,
            acknowledged_at: row.get(8)?,
        })
    }

    fn into_alert(self) -> Result<Alert> {
        Ok(Alert {
            alert_id: self.alert_id,
            detection_id: self.detection_id,
            threat_score: self.threat_score,
            threat_category: self.threat_category.parse::<ThreatCategory>()?,
            explanation: self.explanation,
            created_at: parse_ts(&self.created_at)?,
            acknowledged: self.acknowledged,
            acknowledged_by: self.acknowledged_by,
            acknowledged_at: parse_opt_ts(self.acknowledged_at)?,
        })
    }
}

struct ClassificationRow {
    detection_id: String,
    source: String,
    threat_score: f64,
    threat_category: String,
    feature_attributions: String,
    classified_at: String,
    model_version: String,
    forwarded_at: Option<String>,
}

impl ClassificationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            detection_id: row.get(0)?,
            source: row.get(1)?,
            threat_score: row.get(2)?,
            threat_category: row.get(3)?,
            feature_attributions: row.get(4)?,
            classified_at: row.get(5)?,
            model_version: row.get(6)?,
            forwarded_at: row.get(7)?,
        })
    }

    fn into_result(self) -> Result<ClassificationResult> {
        Ok(ClassificationResult {
            detection_id: self.detection_id,
            source: self.source,
            threat_score: self.threat_score,
            threat_category: self.threat_category.parse::<ThreatCategory>()?,
            feature_attributions: serde_json::from_str(&self.feature_attributions)?,
            classified_at: parse_ts(&self.classified_at)?,
            model_version: self.model_version,
            forwarded_at: parse_opt_ts(self.forwarded_at)?,
        })
    }
}

fn load_alert(conn: &Connection, alert_id: &str) -> Result<Option<Alert>> {
    let sql = format!("SELECT {} FROM alerts WHERE alert_id = ?1", ALERT_COLUMNS);
    conn.query_row(&sql, params![alert_id], AlertRow::read)
        .optional()?
        .map(AlertRow::into_alert)
        .transpose()
}

/// Record store on a SQLite database file
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "Opened SQLite record store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        run_blocking(&self.conn, f).await
    }
}

/// Run `f` against a shared connection on the blocking pool
pub(crate) async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock().map_err(|_| {
            SentinelError::Unavailable("sqlite connection lock poisoned".to_string())
        })?;
        f(&mut conn)
    })
    .await
    .map_err(|e| SentinelError::Unavailable(format!("sqlite task failed: {}", e)))?
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_classification(&self, result: &ClassificationResult) -> Result<()> {
        let result = result.clone();
        let attributions = serde_json::to_string(&result.feature_attributions)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO classifications (detection_id, source, threat_score, threat_category, \
                 feature_attributions, classified_at, model_version, forwarded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    result.detection_id,
                    result.source,
                    result.threat_score,
                    result.threat_category.as_str(),
                    attributions,
                    ts(&result.classified_at),
                    result.model_version,
                    result.forwarded_at.as_ref().map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_classification(&self, detection_id: &str) -> Result<Option<ClassificationResult>> {
        let detection_id = detection_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM classifications WHERE detection_id = ?1",
                CLASSIFICATION_COLUMNS
            );
            conn.query_row(&sql, params![detection_id], ClassificationRow::read)
                .optional()?
                .map(ClassificationRow::into_result)
                .transpose()
        })
        .await
    }

    async fn mark_forwarded(&self, detection_id: &str, at: DateTime<Utc>) -> Result<()> {
        let detection_id = detection_id.to_string();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM classifications WHERE detection_id = ?1",
                    params![detection_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(SentinelError::NotFound(format!("classification {}", detection_id)));
            }
            conn.execute(
                "UPDATE classifications SET forwarded_at = ?2 \
                 WHERE detection_id = ?1 AND forwarded_at IS NULL",
                params![detection_id, ts(&at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alerts (alert_id, detection_id, threat_score, threat_category, \
                 explanation, created_at, acknowledged, acknowledged_by, acknowledged_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    alert.alert_id,
                    alert.detection_id,
                    alert.threat_score,
                    alert.threat_category.as_str(),
                    alert.explanation,
                    ts(&alert.created_at),
                    alert.acknowledged,
                    alert.acknowledged_by,
                    alert.acknowledged_at.as_ref().map(ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let alert_id = alert_id.to_string();
        self.with_conn(move |conn| load_alert(conn, &alert_id)).await
    }

    async fn alert_for_detection(&self, detection_id: &str) -> Result<Option<Alert>> {
        let detection_id = detection_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM alerts WHERE detection_id = ?1", ALERT_COLUMNS);
            conn.query_row(&sql, params![detection_id], AlertRow::read)
                .optional()?
                .map(AlertRow::into_alert)
                .transpose()
        })
        .await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(category) = query.category {
                clauses.push("threat_category = ?");
                values.push(Value::Text(category.as_str().to_string()));
            }
            if let Some(acknowledged) = query.acknowledged {
                clauses.push("acknowledged = ?");
                values.push(Value::Integer(i64::from(acknowledged)));
            }
            if let Some(since) = query.since {
                clauses.push("created_at >= ?");
                values.push(Value::Text(ts(&since)));
            }
            if let Some(until) = query.until {
                clauses.push("created_at < ?");
                values.push(Value::Text(ts(&until)));
            }
            values.push(Value::Integer(query.limit as i64));

            let filter = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!(
                "SELECT {} FROM alerts {} ORDER BY created_at DESC LIMIT ?",
                ALERT_COLUMNS, filter
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), AlertRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(AlertRow::into_alert).collect()
        })
        .await
    }

    async fn acknowledge_alert(
        &self,
        alert_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Acknowledgement> {
        let alert_id = alert_id.to_string();
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE alerts SET acknowledged = 1, acknowledged_by = ?2, acknowledged_at = ?3 \
                 WHERE alert_id = ?1 AND acknowledged = 0",
                params![alert_id, actor, ts(&at)],
            )?;
            let alert = load_alert(&tx, &alert_id)?
                .ok_or_else(|| SentinelError::NotFound(format!("alert {}", alert_id)))?;
            tx.commit()?;
            Ok(Acknowledgement {
                alert,
                transitioned: changed == 1,
            })
        })
        .await
    }

    async fn counts(&self) -> Result<RecordCounts> {
        self.with_conn(|conn| {
            let classifications: i64 =
                conn.query_row("SELECT COUNT(*) FROM classifications", [], |row| row.get(0))?;
            let alert_counts: (i64, i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), \
                     COALESCE(SUM(threat_category = ?1), 0), \
                     COALESCE(SUM(threat_category = ?2), 0), \
                     COALESCE(SUM(acknowledged), 0) \
                 FROM alerts",
                params![
                    ThreatCategory::Critical.as_str(),
                    ThreatCategory::HighThreat.as_str()
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            let (alerts, critical, high_threat, acknowledged) = alert_counts;
            Ok(RecordCounts {
                classifications: classifications as u64,
                alerts: alerts as u64,
                critical_alerts: critical as u64,
                high_threat_alerts: high_threat as u64,
                acknowledged_alerts: acknowledged as u64,
            })
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
