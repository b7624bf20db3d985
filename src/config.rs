//! Configuration for the token authority, queue, and pipeline stages
//!
//! Every field has a default. `SentinelConfig::from_env()` overlays the
//! `SENTINEL_*` environment variables on top of those defaults, and
//! `from_file()` loads a camelCase JSON document.

use crate::error::{Result, SentinelError};
use crate::queue::nats::NatsConfig;
use crate::types::{Permission, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum HMAC key length in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelConfig {
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,

    /// Use NATS JetStream as the pipeline queue when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsConfig>,
}

/// Token authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// HMAC-SHA256 signing key
    pub signing_secret: String,

    /// Lifetime of every issued token
    pub token_ttl_secs: u64,

    /// How long a revocation entry is kept. Must be >= `token_ttl_secs`.
    pub revocation_ttl_secs: u64,

    /// Upper bound on a credential store lookup during validation
    pub validation_timeout_ms: u64,

    /// Service credentials re-mint this long before expiry
    pub refresh_margin_secs: u64,

    pub users: Vec<UserAccount>,

    pub services: Vec<ServiceAccount>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            token_ttl_secs: 3600,
            revocation_ttl_secs: 3900,
            validation_timeout_ms: 250,
            refresh_margin_secs: 60,
            users: Vec::new(),
            services: default_services(),
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn revocation_ttl(&self) -> Duration {
        Duration::from_secs(self.revocation_ttl_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
}

fn default_services() -> Vec<ServiceAccount> {
    [
        "cv-detection-service",
        "ml-classification-service",
        "alert-service",
        "api-gateway",
    ]
    .into_iter()
    .map(ServiceAccount::new)
    .collect()
}

/// A human user with a PBKDF2 password hash
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub username: String,

    /// `pbkdf2-sha256$<iterations>$<salt>$<hash>`
    pub password_hash: String,

    pub role: Role,
}

/// A cooperating service allowed to hold service tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub name: String,

    #[serde(default = "default_service_role")]
    pub role: Role,

    /// Narrower scopes than the role grants; `None` means the role's full set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<Permission>>,
}

fn default_service_role() -> Role {
    Role::Service
}

impl ServiceAccount {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Service,
            scopes: None,
        }
    }
}

/// Pipeline queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Claimed messages become visible again after this long without an ack
    pub lease_ms: u64,

    /// A message delivered more often than this is dead-lettered
    pub max_attempts: u32,

    /// How long a worker waits for a message before polling again
    pub poll_interval_ms: u64,

    /// Interval of the background lease sweeper
    pub sweep_interval_ms: u64,

    /// Max dead letters kept by the in-memory DLQ
    pub dlq_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            max_attempts: 5,
            poll_interval_ms: 100,
            sweep_interval_ms: 1_000,
            dlq_capacity: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Stage behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Classifications at or above this score raise an alert
    pub alert_threshold: f64,

    /// Detected objects below this confidence are discarded
    pub confidence_threshold: f64,

    /// Confidence above which a detection counts as high-confidence
    pub high_confidence: f64,

    pub detection_timeout_ms: u64,

    pub scoring_timeout_ms: u64,

    /// Worker tasks spawned per consuming stage
    pub workers_per_stage: usize,

    /// Consumer group name used by queue backends with durable consumers
    pub consumer_group: String,

    /// Alerts kept by the in-process recent-alerts feed
    pub alert_feed_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 0.7,
            confidence_threshold: 0.5,
            high_confidence: 0.7,
            detection_timeout_ms: 5_000,
            scoring_timeout_ms: 2_000,
            workers_per_stage: 2,
            consumer_group: "sentinel".to_string(),
            alert_feed_capacity: 100,
        }
    }
}

impl PipelineConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_millis(self.scoring_timeout_ms)
    }
}

/// Relational store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// SQLite database file; in-memory store when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl SentinelConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SentinelError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: SentinelConfig = serde_json::from_str(&json).map_err(|e| {
            SentinelError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Defaults overlaid with `SENTINEL_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(secret) = lookup("SENTINEL_SIGNING_SECRET") {
            self.auth.signing_secret = secret;
        }
        if let Some(v) = lookup("SENTINEL_TOKEN_TTL_SECS") {
            self.auth.token_ttl_secs = parse_env("SENTINEL_TOKEN_TTL_SECS", &v)?;
            // Keep the revocation window ahead of the token lifetime
            self.auth.revocation_ttl_secs =
                self.auth.revocation_ttl_secs.max(self.auth.token_ttl_secs);
        }
        if let Some(v) = lookup("SENTINEL_ALERT_THRESHOLD") {
            self.pipeline.alert_threshold = parse_env("SENTINEL_ALERT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_CONFIDENCE_THRESHOLD") {
            self.pipeline.confidence_threshold = parse_env("SENTINEL_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_HIGH_CONFIDENCE") {
            self.pipeline.high_confidence = parse_env("SENTINEL_HIGH_CONFIDENCE", &v)?;
        }
        if let Some(v) = lookup("SENTINEL_LEASE_SECS") {
            let secs: u64 = parse_env("SENTINEL_LEASE_SECS", &v)?;
            self.queue.lease_ms = secs * 1000;
        }
        if let Some(v) = lookup("SENTINEL_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_env("SENTINEL_MAX_ATTEMPTS", &v)?;
        }
        if let Some(url) = lookup("SENTINEL_NATS_URL") {
            let nats = self.nats.get_or_insert_with(NatsConfig::default);
            nats.url = url;
        }
        if let Some(path) = lookup("SENTINEL_DATABASE_PATH") {
            self.store.database_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        if auth.signing_secret.len() < MIN_SECRET_LEN {
            return Err(SentinelError::Config(format!(
                "Signing secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if auth.token_ttl_secs == 0 {
            return Err(SentinelError::Config(
                "Token TTL must be greater than zero".to_string(),
            ));
        }
        if auth.revocation_ttl_secs < auth.token_ttl_secs {
            return Err(SentinelError::Config(format!(
                "Revocation TTL ({}s) must cover the token lifetime ({}s)",
                auth.revocation_ttl_secs, auth.token_ttl_secs
            )));
        }
        for user in &auth.users {
            if user.role == Role::Service {
                return Err(SentinelError::Config(format!(
                    "User '{}' cannot hold the service role",
                    user.username
                )));
            }
        }

        let p = &self.pipeline;
        for (name, value) in [
            ("alertThreshold", p.alert_threshold),
            ("confidenceThreshold", p.confidence_threshold),
            ("highConfidence", p.high_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SentinelError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if p.workers_per_stage == 0 {
            return Err(SentinelError::Config(
                "workersPerStage must be at least 1".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(SentinelError::Config(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.queue.lease_ms == 0 {
            return Err(SentinelError::Config(
                "Lease must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SentinelError::Config(format!("Invalid {}='{}': {}", key, value, e)))
}
