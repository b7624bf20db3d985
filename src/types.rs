//! Core data model shared by the token authority and the pipeline stages
//!
//! All records use camelCase JSON serialization for wire compatibility.
//! Enumerations serialize as snake_case strings (`high_threat`, `admin`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SentinelError;

/// Object classes counted as vehicles
pub const VEHICLE_CLASSES: &[&str] = &["car", "truck", "motorcycle", "bus"];

/// Role assigned to a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Service,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Service => "service",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            "service" => Ok(Role::Service),
            other => Err(SentinelError::Config(format!("Unknown role '{}'", other))),
        }
    }
}

/// A single permission in the RBAC matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Manage,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Manage => "manage",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a principal is a human user or a cooperating service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Service,
}

/// A user or service identity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub role: Role,
}

impl Principal {
    pub fn user(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::User,
            role,
        }
    }

    pub fn service(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Service,
            role,
        }
    }
}

/// One object returned by the detection model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedObject {
    /// Class label (e.g., "person", "car")
    pub class: String,

    /// Bounding box as `[x, y, w, h]`
    pub bbox: [f64; 4],

    /// Model confidence in `[0, 1]`
    pub confidence: f64,
}

impl DetectedObject {
    pub fn new(class: impl Into<String>, bbox: [f64; 4], confidence: f64) -> Self {
        Self {
            class: class.into(),
            bbox,
            confidence,
        }
    }

    pub fn area(&self) -> f64 {
        (self.bbox[2] * self.bbox[3]).max(0.0)
    }

    pub fn is_person(&self) -> bool {
        self.class == "person"
    }

    pub fn is_vehicle(&self) -> bool {
        VEHICLE_CLASSES.contains(&self.class.as_str())
    }
}

/// Coarse threat level assessed at detection time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Numeric feature used by the scorers
    pub fn numeric(&self) -> f64 {
        match self {
            ThreatLevel::Low => 0.25,
            ThreatLevel::Medium => 0.5,
            ThreatLevel::High => 0.75,
            ThreatLevel::Critical => 1.0,
        }
    }

    /// Assess from objects whose confidence exceeds `high_confidence`
    pub fn assess(objects: &[DetectedObject], high_confidence: f64) -> Self {
        let persons = objects
            .iter()
            .filter(|o| o.is_person() && o.confidence > high_confidence)
            .count();
        let vehicles = objects
            .iter()
            .filter(|o| o.is_vehicle() && o.confidence > high_confidence)
            .count();

        if persons >= 3 || vehicles >= 2 {
            ThreatLevel::Critical
        } else if persons >= 2 || vehicles >= 1 {
            ThreatLevel::High
        } else if persons >= 1 {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        }
    }
}

/// A physical detection, produced once by the detection stage
///
/// `detection_id` is the idempotency key for every downstream stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Unique detection identifier (det-<uuid>)
    pub detection_id: String,

    /// Camera or feed that produced the frame
    pub source: String,

    pub captured_at: DateTime<Utc>,

    pub objects: Vec<DetectedObject>,

    #[serde(default)]
    pub threat_level: ThreatLevel,
}

impl DetectionEvent {
    pub fn new(
        source: impl Into<String>,
        objects: Vec<DetectedObject>,
        threat_level: ThreatLevel,
    ) -> Self {
        Self {
            detection_id: format!("det-{}", uuid::Uuid::new_v4()),
            source: source.into(),
            captured_at: Utc::now(),
            objects,
            threat_level,
        }
    }
}

/// Threat category, a pure function of the threat score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    Benign,
    Suspicious,
    HighThreat,
    Critical,
}

impl ThreatCategory {
    /// `<0.4` benign, `[0.4,0.6)` suspicious, `[0.6,0.8)` high threat, `>=0.8` critical
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            ThreatCategory::Critical
        } else if score >= 0.6 {
            ThreatCategory::HighThreat
        } else if score >= 0.4 {
            ThreatCategory::Suspicious
        } else {
            ThreatCategory::Benign
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Benign => "benign",
            ThreatCategory::Suspicious => "suspicious",
            ThreatCategory::HighThreat => "high_threat",
            ThreatCategory::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatCategory {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "benign" => Ok(ThreatCategory::Benign),
            "suspicious" => Ok(ThreatCategory::Suspicious),
            "high_threat" => Ok(ThreatCategory::HighThreat),
            "critical" => Ok(ThreatCategory::Critical),
            other => Err(SentinelError::Unavailable(format!(
                "Unknown threat category '{}' in store",
                other
            ))),
        }
    }
}

/// Classification of one detection. At most one per `detection_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub detection_id: String,

    pub source: String,

    /// Threat probability in `[0, 1]`
    pub threat_score: f64,

    pub threat_category: ThreatCategory,

    /// Per-feature contribution to the score
    pub feature_attributions: BTreeMap<String, f64>,

    pub classified_at: DateTime<Utc>,

    /// "rule-based" for the fallback scorer
    pub model_version: String,

    /// Set once the result has been handed to the alert stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_at: Option<DateTime<Utc>>,
}

/// A raised alert. At most one per `detection_id`.
///
/// Lifecycle: open → acknowledged (terminal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert identifier (alert-<uuid>)
    pub alert_id: String,

    pub detection_id: String,

    pub threat_score: f64,

    pub threat_category: ThreatCategory,

    /// Human-readable summary built from the feature attributions
    pub explanation: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub acknowledged: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn open(classification: &ClassificationResult, explanation: impl Into<String>) -> Self {
        Self {
            alert_id: format!("alert-{}", uuid::Uuid::new_v4()),
            detection_id: classification.detection_id.clone(),
            threat_score: classification.threat_score,
            threat_category: classification.threat_category,
            explanation: explanation.into(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }
}

/// Filters for listing alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ThreatCategory>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged: Option<bool>,

    /// Inclusive lower bound on `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper bound on `created_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,

    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            category: None,
            acknowledged: None,
            since: None,
            until: None,
            limit: default_limit(),
        }
    }
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(category) = self.category {
            if alert.threat_category != category {
                return false;
            }
        }
        if let Some(acknowledged) = self.acknowledged {
            if alert.acknowledged != acknowledged {
                return false;
            }
        }
        if let Some(since) = self.since {
            if alert.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if alert.created_at >= until {
                return false;
            }
        }
        true
    }
}
