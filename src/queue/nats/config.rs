//! NATS JetStream queue configuration

use crate::queue::Topic;
use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and stream settings for the NATS queue backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g., "nats://127.0.0.1:4222")
    pub url: String,

    /// JetStream stream holding every pipeline subject
    pub stream_name: String,

    /// Subject prefix; messages go to `<prefix>.<topic>.<detection_id>`
    pub subject_prefix: String,

    pub storage: StorageType,

    /// Stream message limit (-1 = unlimited)
    pub max_events: i64,

    /// Stream retention age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Stream byte limit (-1 = unlimited)
    pub max_bytes: i64,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "SENTINEL".to_string(),
            subject_prefix: "sentinel".to_string(),
            storage: StorageType::File,
            max_events: 100_000,
            max_age_secs: 7 * 24 * 3600,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            token: None,
        }
    }
}

impl NatsConfig {
    /// Subject for one message: `<prefix>.<topic>.<detection_id>`
    pub fn message_subject(&self, topic: Topic, detection_id: &str) -> String {
        format!("{}.{}.{}", self.subject_prefix, topic, detection_id)
    }

    /// Wildcard filter for a topic's durable consumer
    pub fn topic_filter(&self, topic: Topic) -> String {
        format!("{}.{}.>", self.subject_prefix, topic)
    }

    /// Subject where dead letters of a topic are published
    pub fn dead_letter_subject(&self, topic: Topic) -> String {
        format!("{}.dead_letter.{}", self.subject_prefix, topic)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Durable consumer name of a topic within a consumer group
    pub fn consumer_name(&self, group: &str, topic: Topic) -> String {
        format!("{}-{}", group, topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://127.0.0.1:4222");
        assert_eq!(config.stream_name, "SENTINEL");
        assert_eq!(config.storage, StorageType::File);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_subjects() {
        let config = NatsConfig::default();
        assert_eq!(
            config.message_subject(Topic::Detections, "det-1"),
            "sentinel.detections.det-1"
        );
        assert_eq!(config.topic_filter(Topic::Alerts), "sentinel.alerts.>");
        assert_eq!(
            config.dead_letter_subject(Topic::Classifications),
            "sentinel.dead_letter.classifications"
        );
        assert_eq!(config.stream_subjects(), vec!["sentinel.>"]);
        assert_eq!(config.consumer_name("sentinel", Topic::Detections), "sentinel-detections");
    }

    #[test]
    fn test_dead_letter_subject_outside_topic_filters() {
        let config = NatsConfig::default();
        let dead = config.dead_letter_subject(Topic::Detections);
        for topic in Topic::ALL {
            let prefix = config.topic_filter(topic).trim_end_matches('>').to_string();
            assert!(!dead.starts_with(&prefix));
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"url":"nats://queue:4222","storage":"memory"}"#).unwrap();
        assert_eq!(config.url, "nats://queue:4222");
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.subject_prefix, "sentinel");
    }
}
