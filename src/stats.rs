//! Pipeline statistics
//!
//! Each stage worker owns its counters and only ever increments them. The
//! `StatsAggregator` holds read-only handles to every registered counter set
//! and merges them on demand: counters are summed, running averages are
//! merged weighted by their sample counts. Reads never take a lock a writer
//! could be waiting on.

use crate::store::RecordCounts;
use crate::types::{DetectedObject, ThreatCategory};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Latest timestamp seen, stored as unix millis (0 = never)
#[derive(Default)]
struct LastSeen(AtomicI64);

impl LastSeen {
    fn touch(&self, at: DateTime<Utc>) {
        self.0.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Incremental mean: `avg += (x - avg) / n`
///
/// Writers serialize on a small mutex; the current mean and count are
/// published to atomics so readers never wait.
#[derive(Default)]
pub struct RunningAverage {
    state: Mutex<(u64, f64)>,
    count: AtomicU64,
    average_bits: AtomicU64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, value: f64) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.0 += 1;
        state.1 += (value - state.1) / state.0 as f64;
        self.average_bits.store(state.1.to_bits(), Ordering::Release);
        self.count.store(state.0, Ordering::Release);
    }

    pub fn average(&self) -> f64 {
        f64::from_bits(self.average_bits.load(Ordering::Acquire))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

/// Count-weighted merge of `(count, average)` pairs
fn merge_averages(parts: impl IntoIterator<Item = (u64, f64)>) -> f64 {
    let (total, weighted) = parts
        .into_iter()
        .fold((0u64, 0.0f64), |(n, sum), (count, avg)| (n + count, sum + avg * count as f64));
    if total == 0 {
        0.0
    } else {
        weighted / total as f64
    }
}

/// Counters owned by one detection worker
#[derive(Default)]
pub struct DetectionCounters {
    total_detections: AtomicU64,
    high_confidence_detections: AtomicU64,
    person_detections: AtomicU64,
    vehicle_detections: AtomicU64,
    events_published: AtomicU64,
    per_class: DashMap<String, u64>,
    last_detection_at: LastSeen,
}

impl DetectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one published detection event
    pub fn record_event(
        &self,
        objects: &[DetectedObject],
        high_confidence: f64,
        at: DateTime<Utc>,
    ) {
        bump(&self.events_published);
        self.total_detections
            .fetch_add(objects.len() as u64, Ordering::Relaxed);
        if objects.iter().any(|o| o.confidence > high_confidence) {
            bump(&self.high_confidence_detections);
        }
        for object in objects {
            if object.is_person() {
                bump(&self.person_detections);
            } else if object.is_vehicle() {
                bump(&self.vehicle_detections);
            }
            *self.per_class.entry(object.class.clone()).or_insert(0) += 1;
        }
        self.last_detection_at.touch(at);
    }

    pub fn snapshot(&self) -> DetectionStats {
        DetectionStats {
            total_detections: load(&self.total_detections),
            high_confidence_detections: load(&self.high_confidence_detections),
            person_detections: load(&self.person_detections),
            vehicle_detections: load(&self.vehicle_detections),
            events_published: load(&self.events_published),
            per_class: self
                .per_class
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            last_detection_at: self.last_detection_at.get(),
        }
    }
}

/// Counters owned by one classification worker
#[derive(Default)]
pub struct ClassificationCounters {
    total_classifications: AtomicU64,
    suspicious_classifications: AtomicU64,
    high_threat_classifications: AtomicU64,
    critical_threat_classifications: AtomicU64,
    fallback_classifications: AtomicU64,
    forwarded: AtomicU64,
    duplicates_skipped: AtomicU64,
    rejected: AtomicU64,
    threat_score: RunningAverage,
    last_classification_at: LastSeen,
}

impl ClassificationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_classification(
        &self,
        score: f64,
        category: ThreatCategory,
        fallback: bool,
        at: DateTime<Utc>,
    ) {
        bump(&self.total_classifications);
        match category {
            ThreatCategory::Critical => bump(&self.critical_threat_classifications),
            ThreatCategory::HighThreat => bump(&self.high_threat_classifications),
            ThreatCategory::Suspicious => bump(&self.suspicious_classifications),
            ThreatCategory::Benign => {}
        }
        if fallback {
            bump(&self.fallback_classifications);
        }
        self.threat_score.record(score);
        self.last_classification_at.touch(at);
    }

    pub fn record_forwarded(&self) {
        bump(&self.forwarded);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates_skipped);
    }

    pub fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub fn snapshot(&self) -> ClassificationStats {
        ClassificationStats {
            total_classifications: load(&self.total_classifications),
            suspicious_classifications: load(&self.suspicious_classifications),
            high_threat_classifications: load(&self.high_threat_classifications),
            critical_threat_classifications: load(&self.critical_threat_classifications),
            fallback_classifications: load(&self.fallback_classifications),
            forwarded: load(&self.forwarded),
            duplicates_skipped: load(&self.duplicates_skipped),
            rejected: load(&self.rejected),
            average_threat_score: self.threat_score.average(),
            last_classification_at: self.last_classification_at.get(),
        }
    }

    fn score_sample(&self) -> (u64, f64) {
        (self.threat_score.count(), self.threat_score.average())
    }
}

/// Counters owned by one alert worker
#[derive(Default)]
pub struct AlertCounters {
    total_alerts: AtomicU64,
    critical_alerts: AtomicU64,
    high_threat_alerts: AtomicU64,
    acknowledged_alerts: AtomicU64,
    duplicates_skipped: AtomicU64,
    rejected: AtomicU64,
    last_alert_at: LastSeen,
}

impl AlertCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alert(&self, category: ThreatCategory, at: DateTime<Utc>) {
        bump(&self.total_alerts);
        match category {
            ThreatCategory::Critical => bump(&self.critical_alerts),
            ThreatCategory::HighThreat => bump(&self.high_threat_alerts),
            _ => {}
        }
        self.last_alert_at.touch(at);
    }

    pub fn record_acknowledged(&self) {
        bump(&self.acknowledged_alerts);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates_skipped);
    }

    pub fn record_rejected(&self) {
        bump(&self.rejected);
    }

    pub fn snapshot(&self) -> AlertStats {
        let total = load(&self.total_alerts);
        let acknowledged = load(&self.acknowledged_alerts);
        AlertStats {
            total_alerts: total,
            critical_alerts: load(&self.critical_alerts),
            high_threat_alerts: load(&self.high_threat_alerts),
            acknowledged_alerts: acknowledged,
            active_alerts: total.saturating_sub(acknowledged),
            duplicates_skipped: load(&self.duplicates_skipped),
            rejected: load(&self.rejected),
            last_alert_at: self.last_alert_at.get(),
        }
    }
}

/// Detection stage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    /// Objects detected across all events
    pub total_detections: u64,
    /// Events with at least one high-confidence object
    pub high_confidence_detections: u64,
    pub person_detections: u64,
    pub vehicle_detections: u64,
    pub events_published: u64,
    pub per_class: BTreeMap<String, u64>,
    pub last_detection_at: Option<DateTime<Utc>>,
}

/// Classification stage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationStats {
    pub total_classifications: u64,
    pub suspicious_classifications: u64,
    pub high_threat_classifications: u64,
    pub critical_threat_classifications: u64,
    pub fallback_classifications: u64,
    pub forwarded: u64,
    pub duplicates_skipped: u64,
    pub rejected: u64,
    pub average_threat_score: f64,
    pub last_classification_at: Option<DateTime<Utc>>,
}

/// Alert stage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStats {
    pub total_alerts: u64,
    pub critical_alerts: u64,
    pub high_threat_alerts: u64,
    pub acknowledged_alerts: u64,
    pub active_alerts: u64,
    pub duplicates_skipped: u64,
    pub rejected: u64,
    pub last_alert_at: Option<DateTime<Utc>>,
}

impl AlertStats {
    /// Replace alert totals with the persisted counts
    ///
    /// In-process counters start from zero on every restart and miss
    /// acknowledgements made by other instances; the record store does not.
    pub fn apply_store_counts(&mut self, counts: &RecordCounts) {
        self.total_alerts = counts.alerts;
        self.critical_alerts = counts.critical_alerts;
        self.high_threat_alerts = counts.high_threat_alerts;
        self.acknowledged_alerts = counts.acknowledged_alerts;
        self.active_alerts = counts.active_alerts();
    }
}

/// Whole-pipeline snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub detection: DetectionStats,
    pub classification: ClassificationStats,
    pub alerts: AlertStats,
    pub generated_at: DateTime<Utc>,
}

/// Merges counter handles registered by every worker
#[derive(Default)]
pub struct StatsAggregator {
    detection: DashMap<String, Arc<DetectionCounters>>,
    classification: DashMap<String, Arc<ClassificationCounters>>,
    alerts: DashMap<String, Arc<AlertCounters>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_detection(&self, owner: impl Into<String>, counters: Arc<DetectionCounters>) {
        self.detection.insert(owner.into(), counters);
    }

    pub fn register_classification(
        &self,
        owner: impl Into<String>,
        counters: Arc<ClassificationCounters>,
    ) {
        self.classification.insert(owner.into(), counters);
    }

    pub fn register_alerts(&self, owner: impl Into<String>, counters: Arc<AlertCounters>) {
        self.alerts.insert(owner.into(), counters);
    }

    pub fn detection(&self) -> DetectionStats {
        self.detection
            .iter()
            .map(|e| e.value().snapshot())
            .fold(DetectionStats::default(), |mut acc, s| {
                acc.total_detections += s.total_detections;
                acc.high_confidence_detections += s.high_confidence_detections;
                acc.person_detections += s.person_detections;
                acc.vehicle_detections += s.vehicle_detections;
                acc.events_published += s.events_published;
                for (class, count) in s.per_class {
                    *acc.per_class.entry(class).or_insert(0) += count;
                }
                acc.last_detection_at = acc.last_detection_at.max(s.last_detection_at);
                acc
            })
    }

    pub fn classification(&self) -> ClassificationStats {
        let handles: Vec<Arc<ClassificationCounters>> =
            self.classification.iter().map(|e| e.value().clone()).collect();

        let mut merged = handles
            .iter()
            .map(|h| h.snapshot())
            .fold(ClassificationStats::default(), |mut acc, s| {
                acc.total_classifications += s.total_classifications;
                acc.suspicious_classifications += s.suspicious_classifications;
                acc.high_threat_classifications += s.high_threat_classifications;
                acc.critical_threat_classifications += s.critical_threat_classifications;
                acc.fallback_classifications += s.fallback_classifications;
                acc.forwarded += s.forwarded;
                acc.duplicates_skipped += s.duplicates_skipped;
                acc.rejected += s.rejected;
                acc.last_classification_at =
                    acc.last_classification_at.max(s.last_classification_at);
                acc
            });
        merged.average_threat_score = merge_averages(handles.iter().map(|h| h.score_sample()));
        merged
    }

    pub fn alerts(&self) -> AlertStats {
        let mut merged = self
            .alerts
            .iter()
            .map(|e| e.value().snapshot())
            .fold(AlertStats::default(), |mut acc, s| {
                acc.total_alerts += s.total_alerts;
                acc.critical_alerts += s.critical_alerts;
                acc.high_threat_alerts += s.high_threat_alerts;
                acc.acknowledged_alerts += s.acknowledged_alerts;
                acc.duplicates_skipped += s.duplicates_skipped;
                acc.rejected += s.rejected;
                acc.last_alert_at = acc.last_alert_at.max(s.last_alert_at);
                acc
            });
        merged.active_alerts = merged.total_alerts.saturating_sub(merged.acknowledged_alerts);
        merged
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            detection: self.detection(),
            classification: self.classification(),
            alerts: self.alerts(),
            generated_at: Utc::now(),
        }
    }
}
