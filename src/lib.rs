//! # a3s-sentinel
//!
//! Zero-trust token authority and an exactly-once-effect perception pipeline
//! for the A3S ecosystem.
//!
//! ## Overview
//!
//! Frames enter the detection stage, which publishes a `DetectionEvent`
//! carrying its service token. Classification workers score each detection
//! once and forward qualifying results; alert workers raise at most one
//! alert per detection. Every hop re-validates the publisher's token, so a
//! revoked or expired service cannot inject work.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_sentinel::{Pipeline, SentinelConfig, StaticDetector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> a3s_sentinel::Result<()> {
//! let config = SentinelConfig::from_env()?;
//! let pipeline = Pipeline::from_config(config).await?;
//! let admin = pipeline.authority().login("admin", "admin123").await?;
//!
//! let handle = pipeline
//!     .start(admin.as_str(), Arc::new(StaticDetector::new(vec![])), None)
//!     .await?;
//! let event = handle.detection().submit("cam-1", b"frame").await?;
//! handle.wait_idle(Duration::from_secs(5)).await?;
//!
//! for alert in handle.alerts().recent_alerts(10).await? {
//!     println!("{} {}", alert.alert_id, alert.explanation);
//! }
//! # let _ = event;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **queue**: in-memory (lease table + sweeper) or NATS JetStream
//! - **store**: in-memory or SQLite
//! - **credentials**: in-memory or SQLite (shared with the record store file)
//!
//! ## Architecture
//!
//! - **TokenAuthority**: issue, validate, revoke, authorize
//! - **PipelineQueue** trait: at-least-once topics with leases and a DLQ
//! - **RecordStore** trait: uniqueness-enforcing home of results and alerts
//! - **Worker** / **MessageHandler**: claim loop and per-stage logic
//! - **AlertFeed**: bounded window over alert notifications
//! - **StatsAggregator**: merged counters across workers

pub mod auth;
pub mod config;
pub mod dlq;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod stats;
pub mod store;
pub mod types;

// Re-export core types
pub use auth::{
    AuthDecision, CredentialStore, Identity, IssueRequest, MemoryCredentialStore, PermissionSet,
    ServiceCredential, SqliteCredentialStore, Token, TokenAuthority,
};
pub use config::{AuthConfig, PipelineConfig, QueueConfig, SentinelConfig, StoreConfig};
pub use dlq::{DeadLetter, DlqHandler, MemoryDlqHandler};
pub use error::{Result, SentinelError};
pub use model::{
    select_scorer, DetectionModel, FixedScoreModel, RuleBasedScorer, ScoringModel, StaticDetector,
    ThreatFeatures, ThreatScorer,
};
pub use pipeline::{ComponentHealth, HealthReport, Pipeline, PipelineHandle};
pub use queue::{PendingMessage, PipelineQueue, QueueDepth, QueueMessage, Topic};
pub use stage::{
    AlertFeed, AlertStage, ClassificationStage, DetectionStage, Disposition, MessageHandler, Worker,
};
pub use stats::{PipelineStats, StatsAggregator};
pub use store::{MemoryRecordStore, RecordCounts, RecordStore, SqliteRecordStore};
pub use types::{
    Alert, AlertQuery, ClassificationResult, DetectedObject, DetectionEvent, Permission, Role,
    ThreatCategory, ThreatLevel,
};

// Re-export backends for convenience
pub use queue::memory::MemoryQueue;
pub use queue::nats::{NatsConfig, NatsQueue, StorageType};
