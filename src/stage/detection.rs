//! Detection stage: turns frames into published `DetectionEvent`s

use crate::auth::ServiceCredential;
use crate::config::PipelineConfig;
use crate::error::{Result, SentinelError};
use crate::model::DetectionModel;
use crate::queue::{PipelineQueue, QueueMessage, Topic};
use crate::stats::DetectionCounters;
use crate::types::{DetectionEvent, ThreatLevel};
use std::sync::Arc;
use std::time::Duration;

pub struct DetectionStage {
    model: Arc<dyn DetectionModel>,
    queue: Arc<dyn PipelineQueue>,
    credential: Arc<ServiceCredential>,
    counters: Arc<DetectionCounters>,
    confidence_threshold: f64,
    high_confidence: f64,
    timeout: Duration,
}

impl DetectionStage {
    pub fn new(
        model: Arc<dyn DetectionModel>,
        queue: Arc<dyn PipelineQueue>,
        credential: Arc<ServiceCredential>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            model,
            queue,
            credential,
            counters: Arc::new(DetectionCounters::new()),
            confidence_threshold: config.confidence_threshold,
            high_confidence: config.high_confidence,
            timeout: config.detection_timeout(),
        }
    }

    pub fn counters(&self) -> Arc<DetectionCounters> {
        self.counters.clone()
    }

    /// Detect objects in a frame and publish the event
    ///
    /// Fails with `DetectionUnavailable` if the model errors or times out;
    /// nothing is published in that case.
    pub async fn submit(&self, source: &str, image: &[u8]) -> Result<DetectionEvent> {
        let objects = tokio::time::timeout(self.timeout, self.model.detect(image))
            .await
            .map_err(|_| {
                SentinelError::DetectionUnavailable(format!(
                    "{} timed out after {}ms",
                    self.model.name(),
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| match e {
                SentinelError::DetectionUnavailable(_) => e,
                other => SentinelError::DetectionUnavailable(other.to_string()),
            })?;

        let objects: Vec<_> = objects
            .into_iter()
            .filter(|o| o.confidence >= self.confidence_threshold)
            .collect();
        let threat_level = ThreatLevel::assess(&objects, self.high_confidence);
        let event = DetectionEvent::new(source, objects, threat_level);

        let bearer = self.credential.bearer().await?;
        let message =
            QueueMessage::encode(Topic::Detections, &event.detection_id, &event)?
                .with_token(bearer);
        self.queue.publish(message).await?;

        self.counters
            .record_event(&event.objects, self.high_confidence, event.captured_at);

        tracing::info!(
            detection_id = %event.detection_id,
            source = %event.source,
            objects = event.objects.len(),
            threat_level = ?event.threat_level,
            "Detection published"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::test_authority;
    use crate::model::StaticDetector;
    use crate::queue::memory::MemoryQueue;
    use crate::types::DetectedObject;
    use async_trait::async_trait;

    struct BrokenDetector;

    #[async_trait]
    impl DetectionModel for BrokenDetector {
        async fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedObject>> {
            Err(SentinelError::Unavailable("gpu lost".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    async fn stage(model: Arc<dyn DetectionModel>, queue: &MemoryQueue) -> DetectionStage {
        let authority = Arc::new(test_authority());
        let admin = authority.login("admin", "admin123").await.unwrap();
        let credential = ServiceCredential::bootstrap(
            authority,
            "cv-detection-service",
            admin.as_str(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        DetectionStage::new(
            model,
            Arc::new(queue.clone()),
            Arc::new(credential),
            &PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_submit_publishes_filtered_event() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        let detector = StaticDetector::new(vec![
            DetectedObject::new("person", [0.0, 0.0, 10.0, 10.0], 0.95),
            DetectedObject::new("person", [0.0, 0.0, 10.0, 10.0], 0.3),
            DetectedObject::new("car", [0.0, 0.0, 10.0, 10.0], 0.8),
        ]);
        let stage = stage(Arc::new(detector), &queue).await;

        let event = stage.submit("cam-1", b"frame").await.unwrap();
        assert!(event.detection_id.starts_with("det-"));
        assert_eq!(event.objects.len(), 2);
        assert_eq!(event.threat_level, ThreatLevel::High);

        let pending = queue
            .claim(Topic::Detections, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.message.detection_id, event.detection_id);
        assert!(pending.message.token.is_some());
        assert_eq!(pending.message.decode::<DetectionEvent>().unwrap(), event);

        let stats = stage.counters().snapshot();
        assert_eq!(stats.total_detections, 2);
        assert_eq!(stats.high_confidence_detections, 1);
        assert_eq!(stats.person_detections, 1);
        assert_eq!(stats.vehicle_detections, 1);
    }

    #[tokio::test]
    async fn test_model_failure_publishes_nothing() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        let stage = stage(Arc::new(BrokenDetector), &queue).await;

        let err = stage.submit("cam-1", b"frame").await.unwrap_err();
        assert!(matches!(err, SentinelError::DetectionUnavailable(_)));
        assert_eq!(queue.published(Topic::Detections), 0);
        assert_eq!(stage.counters().snapshot().events_published, 0);
    }
}
