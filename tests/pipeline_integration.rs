//! Pipeline integration tests
//!
//! End-to-end runs of the full pipeline on in-memory and SQLite backends.
//! Covers the frame-to-alert path, redelivery, token revocation, retries,
//! scoring fallback, acknowledgement, and concurrent workers.

use a3s_sentinel::auth::{hash_password, MemoryCredentialStore};
use a3s_sentinel::config::UserAccount;
use a3s_sentinel::store::Acknowledgement;
use a3s_sentinel::{
    Alert, AlertQuery, ClassificationResult, DetectedObject, DetectionEvent, DetectionModel,
    FixedScoreModel, MemoryQueue, MemoryRecordStore, Pipeline, PipelineHandle, PipelineQueue,
    QueueMessage, RecordStore, Result, Role, ScoringModel, SentinelConfig, SentinelError,
    SqliteRecordStore, StaticDetector, ThreatCategory, ThreatFeatures, ThreatLevel,
    TokenAuthority, Topic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "integration-secret-0123456789abcdef";
const IDLE: Duration = Duration::from_secs(5);

fn test_config() -> SentinelConfig {
    let user = |name: &str, password: &str, role| UserAccount {
        username: name.to_string(),
        password_hash: hash_password(password, 1_000).unwrap(),
        role,
    };
    let mut config = SentinelConfig::default();
    config.auth.signing_secret = SECRET.to_string();
    config.auth.users = vec![
        user("admin", "admin123", Role::Admin),
        user("operator", "operator123", Role::Operator),
        user("viewer", "viewer123", Role::Viewer),
    ];
    config.queue.poll_interval_ms = 10;
    config
}

fn person_detector() -> Arc<dyn DetectionModel> {
    Arc::new(StaticDetector::new(vec![DetectedObject::new(
        "person",
        [10.0, 10.0, 50.0, 120.0],
        0.95,
    )]))
}

fn fixed(score: f64) -> Option<Arc<dyn ScoringModel>> {
    Some(Arc::new(FixedScoreModel::new(score, "fixed-v1")))
}

async fn start(pipeline: Pipeline, model: Option<Arc<dyn ScoringModel>>) -> PipelineHandle {
    let admin = pipeline.authority().login("admin", "admin123").await.unwrap();
    pipeline
        .start(admin.as_str(), person_detector(), model)
        .await
        .unwrap()
}

/// Pipeline on a memory queue the test can inspect
fn memory_pipeline(
    config: SentinelConfig,
    store: Arc<dyn RecordStore>,
) -> (Pipeline, MemoryQueue) {
    let queue = MemoryQueue::from_config(&config.queue);
    let authority = Arc::new(
        TokenAuthority::new(&config.auth, Arc::new(MemoryCredentialStore::new())).unwrap(),
    );
    let pipeline = Pipeline::with_components(config, authority, Arc::new(queue.clone()), store);
    (pipeline, queue)
}

/// A detection published as the detection service would
async fn detection_message(handle: &PipelineHandle) -> (DetectionEvent, QueueMessage, String) {
    let authority = handle.authority();
    let admin = authority.login("admin", "admin123").await.unwrap();
    let detector = authority
        .service_token("cv-detection-service", admin.as_str())
        .await
        .unwrap();

    let objects = vec![DetectedObject::new("person", [0.0, 0.0, 40.0, 90.0], 0.9)];
    let level = ThreatLevel::assess(&objects, 0.7);
    let event = DetectionEvent::new("cam-7", objects, level);
    let message = QueueMessage::encode(Topic::Detections, &event.detection_id, &event)
        .unwrap()
        .with_token(detector.as_str());
    (event, message, detector.token_id().to_string())
}

// ─── Frame to alert ──────────────────────────────────────────────

#[tokio::test]
async fn test_frame_raises_one_critical_alert() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let handle = start(pipeline, fixed(0.85)).await;

    let event = handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let classification = handle
        .classification()
        .classification(&event.detection_id)
        .await
        .unwrap();
    assert_eq!(classification.threat_category, ThreatCategory::Critical);
    assert_eq!(classification.model_version, "fixed-v1");

    let alerts = handle
        .alerts()
        .list_alerts(&AlertQuery {
            acknowledged: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].detection_id, event.detection_id);
    assert_eq!(alerts[0].threat_category, ThreatCategory::Critical);
    assert!(alerts[0].explanation.starts_with("Critical threat detected (85%"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_below_threshold_raises_no_alert() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let handle = start(pipeline, fixed(0.5)).await;

    let event = handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let classification = handle
        .classification()
        .classification(&event.detection_id)
        .await
        .unwrap();
    assert_eq!(classification.threat_category, ThreatCategory::Suspicious);
    assert!(handle.alerts().recent_alerts(10).await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

// ─── Acknowledgement ─────────────────────────────────────────────

#[tokio::test]
async fn test_acknowledge_twice_keeps_first_acknowledgement() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let handle = start(pipeline, fixed(0.9)).await;

    handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());
    let alert_id = handle.alerts().recent_alerts(1).await.unwrap()[0]
        .alert_id
        .clone();

    let operator = handle.authority().login("operator", "operator123").await.unwrap();
    let first = handle
        .alerts()
        .acknowledge_as(operator.as_str(), &alert_id)
        .await
        .unwrap();
    let admin = handle.authority().login("admin", "admin123").await.unwrap();
    let second = handle
        .alerts()
        .acknowledge_as(admin.as_str(), &alert_id)
        .await
        .unwrap();

    assert!(second.acknowledged);
    assert_eq!(second.acknowledged_at, first.acknowledged_at);
    assert_eq!(second.acknowledged_by.as_deref(), Some("operator"));

    let viewer = handle.authority().login("viewer", "viewer123").await.unwrap();
    assert!(matches!(
        handle.alerts().acknowledge_as(viewer.as_str(), &alert_id).await,
        Err(SentinelError::Forbidden(_))
    ));
    assert!(matches!(
        handle.alerts().acknowledge("alert-unknown", "operator").await,
        Err(SentinelError::NotFound(_))
    ));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.alerts.acknowledged_alerts, 1);
    assert_eq!(stats.alerts.active_alerts, 0);

    handle.shutdown().await.unwrap();
}

// ─── Redelivery and revocation ───────────────────────────────────

#[tokio::test]
async fn test_redelivered_detection_has_single_effect() {
    let (pipeline, queue) =
        memory_pipeline(test_config(), Arc::new(MemoryRecordStore::new()));
    let handle = start(pipeline, fixed(0.9)).await;

    let (event, message, _) = detection_message(&handle).await;
    // A publisher retrying after lost acks
    for n in 0..3 {
        let mut copy = message.clone();
        copy.message_id = format!("msg-retry-{}", n);
        handle.queue().publish(copy).await.unwrap();
    }
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let counts = handle.store().counts().await.unwrap();
    assert_eq!(counts.classifications, 1);
    assert_eq!(counts.alerts, 1);
    assert_eq!(queue.published(Topic::Classifications), 1);
    assert_eq!(queue.published(Topic::Alerts), 1);
    assert!(handle
        .store()
        .alert_for_detection(&event.detection_id)
        .await
        .unwrap()
        .is_some());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.classification.total_classifications, 1);
    assert_eq!(stats.classification.duplicates_skipped, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_revoked_publisher_is_dead_lettered() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let handle = start(pipeline, fixed(0.9)).await;

    let (event, message, token_id) = detection_message(&handle).await;
    let admin = handle.authority().login("admin", "admin123").await.unwrap();
    let admin_identity = handle.authority().validate(admin.as_str()).await.unwrap();
    handle
        .authority()
        .revoke(&token_id, &admin_identity)
        .await
        .unwrap();

    handle.queue().publish(message).await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let dead = handle.queue().dlq().list(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "token_revoked");
    assert_eq!(dead[0].message.detection_id, event.detection_id);

    assert!(matches!(
        handle.classification().classification(&event.detection_id).await,
        Err(SentinelError::NotFound(_))
    ));
    assert_eq!(handle.stats().await.unwrap().classification.rejected, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_without_token_is_dead_lettered() {
    let pipeline = Pipeline::from_config(test_config()).await.unwrap();
    let handle = start(pipeline, fixed(0.9)).await;

    let (_, mut message, _) = detection_message(&handle).await;
    message.token = None;
    handle.queue().publish(message).await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let depth = handle.queue().depth(Topic::Detections).await.unwrap();
    assert_eq!(depth.dead_lettered, 1);
    assert_eq!(handle.store().counts().await.unwrap().classifications, 0);

    handle.shutdown().await.unwrap();
}

// ─── Retries and fallback ────────────────────────────────────────

/// Record store whose first classification inserts fail with an outage
struct FlakyStore {
    inner: MemoryRecordStore,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn insert_classification(&self, result: &ClassificationResult) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SentinelError::Unavailable("database restarting".into()));
        }
        self.inner.insert_classification(result).await
    }

    async fn get_classification(&self, detection_id: &str) -> Result<Option<ClassificationResult>> {
        self.inner.get_classification(detection_id).await
    }

    async fn mark_forwarded(&self, detection_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_forwarded(detection_id, at).await
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.inner.insert_alert(alert).await
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        self.inner.get_alert(alert_id).await
    }

    async fn alert_for_detection(&self, detection_id: &str) -> Result<Option<Alert>> {
        self.inner.alert_for_detection(detection_id).await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        self.inner.list_alerts(query).await
    }

    async fn acknowledge_alert(
        &self,
        alert_id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Acknowledgement> {
        self.inner.acknowledge_alert(alert_id, actor, at).await
    }

    async fn counts(&self) -> Result<a3s_sentinel::store::RecordCounts> {
        self.inner.counts().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn test_transient_store_outage_is_retried() {
    let mut config = test_config();
    config.pipeline.workers_per_stage = 1;
    let store = Arc::new(FlakyStore {
        inner: MemoryRecordStore::new(),
        failures_left: AtomicUsize::new(2),
    });
    let (pipeline, _queue) = memory_pipeline(config, store);
    let handle = start(pipeline, fixed(0.9)).await;

    let event = handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    assert!(handle
        .classification()
        .classification(&event.detection_id)
        .await
        .is_ok());
    assert_eq!(handle.store().counts().await.unwrap().alerts, 1);
    assert!(handle.queue().dlq().list(10).await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persistent_outage_exhausts_attempts() {
    let mut config = test_config();
    config.queue.max_attempts = 3;
    let store = Arc::new(FlakyStore {
        inner: MemoryRecordStore::new(),
        failures_left: AtomicUsize::new(usize::MAX),
    });
    let (pipeline, _queue) = memory_pipeline(config, store);
    let handle = start(pipeline, fixed(0.9)).await;

    handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let dead = handle.queue().dlq().list(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "max_attempts_exceeded");
    assert_eq!(dead[0].message.attempt_count, 4);

    handle.shutdown().await.unwrap();
}

struct SlowModel;

#[async_trait]
impl ScoringModel for SlowModel {
    async fn score(&self, _features: &ThreatFeatures) -> Result<f64> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(0.99)
    }

    fn version(&self) -> &str {
        "slow-v1"
    }
}

#[tokio::test]
async fn test_scoring_timeout_falls_back_to_rules() {
    let mut config = test_config();
    config.pipeline.scoring_timeout_ms = 50;
    let pipeline = Pipeline::from_config(config).await.unwrap();
    let handle = start(pipeline, Some(Arc::new(SlowModel))).await;

    let event = handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let classification = handle
        .classification()
        .classification(&event.detection_id)
        .await
        .unwrap();
    assert_eq!(classification.model_version, "rule-based");
    // 0.2 person + 0.3 * 0.95 confidence + 0.2 * 0.5 medium level
    assert!((classification.threat_score - 0.585).abs() < 1e-9);
    assert_eq!(classification.threat_category, ThreatCategory::Suspicious);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.classification.fallback_classifications, 1);
    assert_eq!(stats.alerts.total_alerts, 0);

    handle.shutdown().await.unwrap();
}

// ─── Concurrency and persistence ─────────────────────────────────

#[tokio::test]
async fn test_concurrent_workers_one_alert_per_detection() {
    let mut config = test_config();
    config.pipeline.workers_per_stage = 4;
    let pipeline = Pipeline::from_config(config).await.unwrap();
    let handle = Arc::new(start(pipeline, fixed(0.8)).await);

    let mut submits = Vec::new();
    for n in 0..20 {
        let handle = handle.clone();
        submits.push(tokio::spawn(async move {
            handle
                .detection()
                .submit(&format!("cam-{}", n % 4), b"frame")
                .await
                .map(|e| e.detection_id)
        }));
    }
    let mut ids = Vec::new();
    for submit in submits {
        ids.push(submit.await.unwrap().unwrap());
    }
    assert!(handle.wait_idle(IDLE).await.unwrap());

    let alerts = handle
        .alerts()
        .list_alerts(&AlertQuery::default())
        .await
        .unwrap();
    assert_eq!(alerts.len(), 20);
    for id in &ids {
        assert_eq!(alerts.iter().filter(|a| &a.detection_id == id).count(), 1);
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.detection.events_published, 20);
    assert_eq!(stats.classification.total_classifications, 20);
    assert_eq!(stats.classification.critical_threat_classifications, 20);
    assert!((stats.classification.average_threat_score - 0.8).abs() < 1e-9);
    assert_eq!(stats.alerts.total_alerts, 20);

    match Arc::try_unwrap(handle) {
        Ok(handle) => handle.shutdown().await.unwrap(),
        Err(_) => panic!("pipeline handle still shared"),
    }
}

#[tokio::test]
async fn test_sqlite_store_persists_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sentinel.db");
    let mut config = test_config();
    config.store.database_path = Some(path.clone());

    let pipeline = Pipeline::from_config(config).await.unwrap();
    let handle = start(pipeline, fixed(0.75)).await;
    let event = handle.detection().submit("cam-1", b"frame").await.unwrap();
    assert!(handle.wait_idle(IDLE).await.unwrap());
    handle.shutdown().await.unwrap();

    let reopened = SqliteRecordStore::open(&path).unwrap();
    let alert = reopened
        .alert_for_detection(&event.detection_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.threat_category, ThreatCategory::HighThreat);
    assert!(reopened
        .get_classification(&event.detection_id)
        .await
        .unwrap()
        .unwrap()
        .forwarded_at
        .is_some());
}
