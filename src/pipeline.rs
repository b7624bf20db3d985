//! Pipeline wiring and worker lifecycle
//!
//! `Pipeline` assembles the token authority, queue, record store, and stats
//! aggregator from a `SentinelConfig`. `start()` mints the stage service
//! credentials and spawns the workers, returning a `PipelineHandle` that
//! exposes the detection entry point, the alert query surface, stats and
//! health.
//!
//! Every worker gets its own stage instance and counters; workers share
//! only the queue and the record store. Each stage credential is kept fresh
//! by its own refresh task, so a stage idle for longer than the token TTL
//! still publishes with a valid token.

use crate::auth::{
    spawn_eviction, CredentialStore, MemoryCredentialStore, ServiceCredential,
    SqliteCredentialStore, TokenAuthority,
};
use crate::config::SentinelConfig;
use crate::error::{Result, SentinelError};
use crate::model::{select_scorer, DetectionModel, ScoringModel, ThreatScorer};
use crate::queue::memory::MemoryQueue;
use crate::queue::nats::NatsQueue;
use crate::queue::{spawn_sweeper, PipelineQueue, QueueDepth, Topic};
use crate::stage::{AlertFeed, AlertStage, ClassificationStage, DetectionStage, Worker};
use crate::stats::{PipelineStats, StatsAggregator};
use crate::store::{MemoryRecordStore, RecordStore, SqliteRecordStore};
use crate::types::Permission;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Service account the detection stage publishes as
pub const DETECTION_SERVICE: &str = "cv-detection-service";

/// Service account the classification stage publishes as
pub const CLASSIFICATION_SERVICE: &str = "ml-classification-service";

/// Service account the alert stage publishes as
pub const ALERT_SERVICE: &str = "alert-service";

/// Interval of the credential store eviction task
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Assembled but not yet running pipeline
pub struct Pipeline {
    config: SentinelConfig,
    authority: Arc<TokenAuthority>,
    queue: Arc<dyn PipelineQueue>,
    store: Arc<dyn RecordStore>,
    stats: Arc<StatsAggregator>,
}

impl Pipeline {
    /// Build every component from configuration
    ///
    /// Uses NATS JetStream when `nats` is set and SQLite when
    /// `store.databasePath` is set; in-memory backends otherwise.
    pub async fn from_config(config: SentinelConfig) -> Result<Self> {
        config.validate()?;

        // Revocations must be visible to every instance sharing the database
        let credentials: Arc<dyn CredentialStore> = match &config.store.database_path {
            Some(path) => Arc::new(SqliteCredentialStore::open(path)?),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let authority = Arc::new(TokenAuthority::new(&config.auth, credentials)?);

        let queue: Arc<dyn PipelineQueue> = match &config.nats {
            Some(nats) => {
                let group = &config.pipeline.consumer_group;
                Arc::new(NatsQueue::connect(nats.clone(), &config.queue, group).await?)
            }
            None => Arc::new(MemoryQueue::from_config(&config.queue)),
        };

        let store: Arc<dyn RecordStore> = match &config.store.database_path {
            Some(path) => Arc::new(SqliteRecordStore::open(path)?),
            None => Arc::new(MemoryRecordStore::new()),
        };

        tracing::info!(
            queue = queue.name(),
            store = store.name(),
            credential_store = authority.store().name(),
            workers_per_stage = config.pipeline.workers_per_stage,
            "Pipeline assembled"
        );

        Ok(Self::with_components(config, authority, queue, store))
    }

    /// Assemble from pre-built components
    pub fn with_components(
        config: SentinelConfig,
        authority: Arc<TokenAuthority>,
        queue: Arc<dyn PipelineQueue>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            config,
            authority,
            queue,
            store,
            stats: Arc::new(StatsAggregator::new()),
        }
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    pub fn queue(&self) -> &Arc<dyn PipelineQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Mint stage credentials and spawn all workers
    ///
    /// `bootstrap_bearer` must be allowed to mint the stage service tokens,
    /// i.e. an admin token. Without a scoring model every classification
    /// uses the rule-based scorer.
    pub async fn start(
        self,
        bootstrap_bearer: &str,
        detector: Arc<dyn DetectionModel>,
        scoring_model: Option<Arc<dyn ScoringModel>>,
    ) -> Result<PipelineHandle> {
        let pipeline = &self.config.pipeline;
        let scorer = select_scorer(scoring_model, pipeline.scoring_timeout());
        let poll_interval = self.config.queue.poll_interval();
        let mut minted = Vec::new();

        let detection = Arc::new(DetectionStage::new(
            detector,
            self.queue.clone(),
            self.mint(DETECTION_SERVICE, bootstrap_bearer, &mut minted).await?,
            pipeline,
        ));
        self.stats.register_detection("detection", detection.counters());

        let classification_api = Arc::new(self.classification_stage(
            scorer.clone(),
            self.mint(CLASSIFICATION_SERVICE, bootstrap_bearer, &mut minted).await?,
        ));
        let alerts_api = Arc::new(
            self.alert_stage(self.mint(ALERT_SERVICE, bootstrap_bearer, &mut minted).await?),
        );
        self.stats.register_alerts("alert-api", alerts_api.counters());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        for n in 0..pipeline.workers_per_stage {
            let credential = self
                .mint(CLASSIFICATION_SERVICE, bootstrap_bearer, &mut minted)
                .await?;
            let stage = Arc::new(self.classification_stage(scorer.clone(), credential));
            let id = format!("classification-{}", n);
            self.stats.register_classification(id.clone(), stage.counters());
            workers.push(
                Worker::new(id, self.queue.clone(), stage, poll_interval)
                    .spawn(shutdown_rx.clone()),
            );

            let credential = self.mint(ALERT_SERVICE, bootstrap_bearer, &mut minted).await?;
            let stage = Arc::new(self.alert_stage(credential));
            let id = format!("alert-{}", n);
            self.stats.register_alerts(id.clone(), stage.counters());
            workers.push(
                Worker::new(id, self.queue.clone(), stage, poll_interval)
                    .spawn(shutdown_rx.clone()),
            );
        }

        let feed = Arc::new(AlertFeed::new(
            self.authority.clone(),
            pipeline.alert_feed_capacity,
        ));
        workers.push(
            Worker::new("alert-feed", self.queue.clone(), feed.clone(), poll_interval)
                .spawn(shutdown_rx.clone()),
        );

        let mut background = vec![
            spawn_sweeper(self.queue.clone(), self.config.queue.sweep_interval()),
            spawn_eviction(self.authority.store().clone(), EVICTION_INTERVAL),
        ];
        background.extend(minted.into_iter().map(ServiceCredential::spawn_refresh));

        tracing::info!(
            workers = workers.len(),
            queue = self.queue.name(),
            scorer = scorer.version(),
            "Pipeline started"
        );

        Ok(PipelineHandle {
            authority: self.authority,
            queue: self.queue,
            store: self.store,
            stats: self.stats,
            detection,
            classification: classification_api,
            alerts: alerts_api,
            feed,
            shutdown,
            workers,
            background,
        })
    }

    /// Mint a stage credential, remembering it for the refresh tasks
    async fn mint(
        &self,
        service: &'static str,
        bootstrap_bearer: &str,
        minted: &mut Vec<Arc<ServiceCredential>>,
    ) -> Result<Arc<ServiceCredential>> {
        let margin = Duration::from_secs(self.config.auth.refresh_margin_secs);
        let credential =
            ServiceCredential::bootstrap(self.authority.clone(), service, bootstrap_bearer, margin)
                .await
                .map(Arc::new)
                .map_err(|e| {
                    tracing::error!(service, error = %e, "Failed to mint stage credential");
                    e
                })?;
        minted.push(credential.clone());
        Ok(credential)
    }

    fn classification_stage(
        &self,
        scorer: Arc<dyn ThreatScorer>,
        credential: Arc<ServiceCredential>,
    ) -> ClassificationStage {
        ClassificationStage::new(
            self.authority.clone(),
            self.store.clone(),
            self.queue.clone(),
            scorer,
            credential,
            self.config.pipeline.alert_threshold,
        )
    }

    fn alert_stage(&self, credential: Arc<ServiceCredential>) -> AlertStage {
        AlertStage::new(
            self.authority.clone(),
            self.store.clone(),
            self.queue.clone(),
            credential,
            self.config.pipeline.alert_threshold,
        )
    }
}

/// Outcome of one component health check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// Backend name (e.g., "memory", "sqlite", "nats")
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_check(name: &str, check: Result<bool>) -> Self {
        let (healthy, error) = match check {
            Ok(healthy) => (healthy, None),
            Err(e) => (false, Some(e.to_string())),
        };
        if !healthy {
            tracing::warn!(component = name, error = ?error, "Health check failed");
        }
        Self {
            name: name.to_string(),
            healthy,
            error,
        }
    }
}

/// Aggregate health of the pipeline's backends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// True when every component is healthy
    pub healthy: bool,
    pub queue: ComponentHealth,
    pub record_store: ComponentHealth,
    pub credential_store: ComponentHealth,
    pub checked_at: DateTime<Utc>,
}

/// Running pipeline
pub struct PipelineHandle {
    authority: Arc<TokenAuthority>,
    queue: Arc<dyn PipelineQueue>,
    store: Arc<dyn RecordStore>,
    stats: Arc<StatsAggregator>,
    detection: Arc<DetectionStage>,
    classification: Arc<ClassificationStage>,
    alerts: Arc<AlertStage>,
    feed: Arc<AlertFeed>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Entry point for frames
    pub fn detection(&self) -> &DetectionStage {
        &self.detection
    }

    /// Classification lookups
    pub fn classification(&self) -> &ClassificationStage {
        &self.classification
    }

    /// Alert queries and acknowledgement
    pub fn alerts(&self) -> &AlertStage {
        &self.alerts
    }

    /// Newest alert notifications
    pub fn feed(&self) -> &AlertFeed {
        &self.feed
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    pub fn queue(&self) -> &Arc<dyn PipelineQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Merged stats across all workers
    ///
    /// Alert totals come from the record store, so they survive restarts
    /// and include alerts raised or acknowledged by other instances.
    pub async fn stats(&self) -> Result<PipelineStats> {
        let mut stats = self.stats.snapshot();
        let counts = self.store.counts().await?;
        stats.alerts.apply_store_counts(&counts);
        Ok(stats)
    }

    /// Stats for a bearer with `read`
    pub async fn stats_as(&self, token: &str) -> Result<PipelineStats> {
        self.authority.authorize(token, Permission::Read).await?;
        self.stats().await
    }

    /// Check the queue, record store and credential store
    pub async fn health(&self) -> HealthReport {
        let credentials = self.authority.store();
        let (queue, record_store, credential_store) = tokio::join!(
            self.queue.health(),
            self.store.health(),
            credentials.health(),
        );
        let queue = ComponentHealth::from_check(self.queue.name(), queue);
        let record_store = ComponentHealth::from_check(self.store.name(), record_store);
        let credential_store = ComponentHealth::from_check(credentials.name(), credential_store);
        HealthReport {
            healthy: queue.healthy && record_store.healthy && credential_store.healthy,
            queue,
            record_store,
            credential_store,
            checked_at: Utc::now(),
        }
    }

    /// Depth of every topic
    pub async fn depths(&self) -> Result<Vec<(Topic, QueueDepth)>> {
        let mut depths = Vec::with_capacity(Topic::ALL.len());
        for topic in Topic::ALL {
            depths.push((topic, self.queue.depth(topic).await?));
        }
        Ok(depths)
    }

    /// Wait until the consumed topics have nothing ready or in flight
    ///
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut busy = false;
            for topic in Topic::ALL {
                let depth = self.queue.depth(topic).await?;
                busy |= depth.ready + depth.in_flight > 0;
            }
            if !busy {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop all workers and background tasks
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for handle in self.background {
            handle.abort();
        }

        let mut failed = 0usize;
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker task ended abnormally");
                failed += 1;
            }
        }
        tracing::info!("Pipeline stopped");

        if failed > 0 {
            return Err(SentinelError::Unavailable(format!(
                "{} worker(s) ended abnormally",
                failed
            )));
        }
        Ok(())
    }
}
