//! External model contracts and the threat scorer capability
//!
//! The detection and scoring models are opaque collaborators. Scoring is
//! modelled as a `ThreatScorer` capability with two implementations, chosen
//! once at startup: `ModelScorer` when a scoring model is loaded, otherwise
//! `RuleBasedScorer`. A model-backed scorer still falls back to the rules
//! for a single call when the model errors or times out.

use crate::error::{Result, SentinelError};
use crate::types::{DetectedObject, DetectionEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Model version reported by the rule-based scorer
pub const RULE_BASED_VERSION: &str = "rule-based";

const PERSON_WEIGHT: f64 = 0.2;
const VEHICLE_WEIGHT: f64 = 0.3;
const CONFIDENCE_WEIGHT: f64 = 0.3;
const LEVEL_WEIGHT: f64 = 0.2;

/// Object detector: image bytes in, bounding boxes out
#[async_trait]
pub trait DetectionModel: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<DetectedObject>>;

    fn name(&self) -> &str;
}

/// Threat probability model: features in, score in `[0, 1]` out
#[async_trait]
pub trait ScoringModel: Send + Sync {
    async fn score(&self, features: &ThreatFeatures) -> Result<f64>;

    fn version(&self) -> &str;
}

/// Numeric features extracted from a detection event
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFeatures {
    pub person_count: f64,
    pub vehicle_count: f64,
    pub average_confidence: f64,
    pub max_confidence: f64,
    pub detection_count: f64,
    pub threat_level_numeric: f64,
    pub average_bbox_area: f64,
    pub max_bbox_area: f64,
}

impl ThreatFeatures {
    pub fn extract(event: &DetectionEvent) -> Self {
        let objects = &event.objects;
        let count = objects.len() as f64;
        let mean = |sum: f64| if objects.is_empty() { 0.0 } else { sum / count };

        Self {
            person_count: objects.iter().filter(|o| o.is_person()).count() as f64,
            vehicle_count: objects.iter().filter(|o| o.is_vehicle()).count() as f64,
            average_confidence: mean(objects.iter().map(|o| o.confidence).sum()),
            max_confidence: objects.iter().map(|o| o.confidence).fold(0.0, f64::max),
            detection_count: count,
            threat_level_numeric: event.threat_level.numeric(),
            average_bbox_area: mean(objects.iter().map(|o| o.area()).sum()),
            max_bbox_area: objects.iter().map(|o| o.area()).fold(0.0, f64::max),
        }
    }

    /// Per-term contributions of the weighted rule
    pub fn attributions(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("person_count".to_string(), PERSON_WEIGHT * self.person_count),
            ("vehicle_count".to_string(), VEHICLE_WEIGHT * self.vehicle_count),
            ("average_confidence".to_string(), CONFIDENCE_WEIGHT * self.average_confidence),
            ("threat_level".to_string(), LEVEL_WEIGHT * self.threat_level_numeric),
        ])
    }
}

/// Output of a scorer
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub threat_score: f64,
    pub feature_attributions: BTreeMap<String, f64>,
    pub model_version: String,
    /// True when a model-backed scorer had to use the rules for this call
    pub fallback: bool,
}

/// Scoring capability used by the classification stage
#[async_trait]
pub trait ThreatScorer: Send + Sync {
    async fn score(&self, features: &ThreatFeatures) -> Result<Score>;

    fn version(&self) -> &str;
}

/// Deterministic weighted-sum scorer
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedScorer;

impl RuleBasedScorer {
    pub fn evaluate(&self, features: &ThreatFeatures) -> Score {
        let attributions = features.attributions();
        let raw: f64 = attributions.values().sum();
        Score {
            threat_score: raw.clamp(0.0, 1.0),
            feature_attributions: attributions,
            model_version: RULE_BASED_VERSION.to_string(),
            fallback: false,
        }
    }
}

#[async_trait]
impl ThreatScorer for RuleBasedScorer {
    async fn score(&self, features: &ThreatFeatures) -> Result<Score> {
        Ok(self.evaluate(features))
    }

    fn version(&self) -> &str {
        RULE_BASED_VERSION
    }
}

/// Scorer backed by an external model, bounded by a timeout
pub struct ModelScorer {
    model: Arc<dyn ScoringModel>,
    timeout: Duration,
    rules: RuleBasedScorer,
}

impl ModelScorer {
    pub fn new(model: Arc<dyn ScoringModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            rules: RuleBasedScorer,
        }
    }

    async fn call_model(&self, features: &ThreatFeatures) -> Result<f64> {
        let score = tokio::time::timeout(self.timeout, self.model.score(features))
            .await
            .map_err(|_| {
                SentinelError::ModelUnavailable(format!(
                    "scoring model timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        if !(0.0..=1.0).contains(&score) {
            return Err(SentinelError::ModelUnavailable(format!(
                "scoring model returned {} outside [0, 1]",
                score
            )));
        }
        Ok(score)
    }
}

#[async_trait]
impl ThreatScorer for ModelScorer {
    async fn score(&self, features: &ThreatFeatures) -> Result<Score> {
        match self.call_model(features).await {
            Ok(threat_score) => Ok(Score {
                threat_score,
                feature_attributions: features.attributions(),
                model_version: self.model.version().to_string(),
                fallback: false,
            }),
            Err(e) => {
                tracing::warn!(
                    model = self.model.version(),
                    error = %e,
                    "Scoring model unavailable, using rule-based score"
                );
                let mut score = self.rules.evaluate(features);
                score.fallback = true;
                Ok(score)
            }
        }
    }

    fn version(&self) -> &str {
        self.model.version()
    }
}

/// Pick the scorer once, based on whether a model is loaded
pub fn select_scorer(
    model: Option<Arc<dyn ScoringModel>>,
    timeout: Duration,
) -> Arc<dyn ThreatScorer> {
    match model {
        Some(model) => {
            tracing::info!(model = model.version(), "Using model-backed threat scorer");
            Arc::new(ModelScorer::new(model, timeout))
        }
        None => {
            tracing::info!("No scoring model loaded, using rule-based threat scorer");
            Arc::new(RuleBasedScorer)
        }
    }
}

/// Scoring model that always returns the same score
pub struct FixedScoreModel {
    score: f64,
    version: String,
}

impl FixedScoreModel {
    pub fn new(score: f64, version: impl Into<String>) -> Self {
        Self {
            score,
            version: version.into(),
        }
    }
}

#[async_trait]
impl ScoringModel for FixedScoreModel {
    async fn score(&self, _features: &ThreatFeatures) -> Result<f64> {
        Ok(self.score)
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Detector that returns the same objects for every frame
pub struct StaticDetector {
    objects: Vec<DetectedObject>,
}

impl StaticDetector {
    pub fn new(objects: Vec<DetectedObject>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl DetectionModel for StaticDetector {
    async fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedObject>> {
        Ok(self.objects.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThreatLevel;

    fn event(objects: Vec<DetectedObject>) -> DetectionEvent {
        let level = ThreatLevel::assess(&objects, 0.7);
        DetectionEvent::new("cam-1", objects, level)
    }

    struct FailingModel;

    #[async_trait]
    impl ScoringModel for FailingModel {
        async fn score(&self, _features: &ThreatFeatures) -> Result<f64> {
            Err(SentinelError::ModelUnavailable("not loaded".into()))
        }

        fn version(&self) -> &str {
            "broken-v1"
        }
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

    #[test]
    fn test_extract_features() {
        let features = ThreatFeatures::extract(&event(vec![
            DetectedObject::new("person", [0.0, 0.0, 10.0, 20.0], 0.9),
            DetectedObject::new("car", [0.0, 0.0, 30.0, 10.0], 0.5),
        ]));

        assert_eq!(features.person_count, 1.0);
        assert_eq!(features.vehicle_count, 1.0);
        assert_eq!(features.detection_count, 2.0);
        assert!((features.average_confidence - 0.7).abs() < 1e-9);
        assert_eq!(features.max_confidence, 0.9);
        assert_eq!(features.average_bbox_area, 250.0);
        assert_eq!(features.max_bbox_area, 300.0);
        // One high-confidence person, no high-confidence vehicle
        assert_eq!(features.threat_level_numeric, 0.5);
    }

    #[test]
    fn test_extract_empty_event() {
        let features = ThreatFeatures::extract(&event(vec![]));
        assert_eq!(features, ThreatFeatures {
            threat_level_numeric: 0.25,
            ..Default::default()
        });
    }

    #[test]
    fn test_rule_based_weighted_sum() {
        let features = ThreatFeatures {
            person_count: 1.0,
            vehicle_count: 1.0,
            average_confidence: 0.5,
            threat_level_numeric: 0.75,
            ..Default::default()
        };
        let score = RuleBasedScorer.evaluate(&features);
        // 0.2 + 0.3 + 0.15 + 0.15
        assert!((score.threat_score - 0.8).abs() < 1e-9);
        assert_eq!(score.model_version, RULE_BASED_VERSION);
        let sum: f64 = score.feature_attributions.values().sum();
        assert!((sum - score.threat_score).abs() < 1e-9);
    }

    #[test]
    fn test_rule_based_clamped() {
        let features = ThreatFeatures {
            person_count: 10.0,
            ..Default::default()
        };
        assert_eq!(RuleBasedScorer.evaluate(&features).threat_score, 1.0);
    }

    #[tokio::test]
    async fn test_model_scorer_uses_model() {
        let model = Arc::new(FixedScoreModel::new(0.85, "fixed-v1"));
        let scorer = ModelScorer::new(model, Duration::from_secs(1));
        let score = scorer.score(&ThreatFeatures::default()).await.unwrap();
        assert_eq!(score.threat_score, 0.85);
        assert_eq!(score.model_version, "fixed-v1");
        assert!(!score.fallback);
    }

    #[tokio::test]
    async fn test_model_error_falls_back() {
        let features = ThreatFeatures {
            person_count: 2.0,
            average_confidence: 0.9,
            threat_level_numeric: 0.75,
            ..Default::default()
        };
        let scorer = ModelScorer::new(Arc::new(FailingModel), Duration::from_secs(1));
        let score = scorer.score(&features).await.unwrap();

        assert!(score.fallback);
        assert_eq!(score.model_version, RULE_BASED_VERSION);
        assert_eq!(score.threat_score, RuleBasedScorer.evaluate(&features).threat_score);
    }

    #[tokio::test]
    async fn test_model_timeout_falls_back() {
        let scorer = ModelScorer::new(Arc::new(SlowModel), Duration::from_millis(20));
        let score = scorer.score(&ThreatFeatures::default()).await.unwrap();
        assert!(score.fallback);
    }

    #[tokio::test]
    async fn test_out_of_range_model_score_falls_back() {
        let scorer =
            ModelScorer::new(Arc::new(FixedScoreModel::new(1.5, "bad")), Duration::from_secs(1));
        assert!(scorer.score(&ThreatFeatures::default()).await.unwrap().fallback);
    }

    #[tokio::test]
    async fn test_select_scorer() {
        assert_eq!(select_scorer(None, Duration::from_secs(1)).version(), RULE_BASED_VERSION);
        let model: Arc<dyn ScoringModel> = Arc::new(FixedScoreModel::new(0.5, "fixed-v2"));
        assert_eq!(select_scorer(Some(model), Duration::from_secs(1)).version(), "fixed-v2");
    }
}
