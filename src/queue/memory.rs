//! In-memory queue backend
//!
//! Models a durable queue inside one process: per-topic ready lists ordered
//! by publish sequence, a claimed-message table with lease timestamps, and a
//! sweeper that returns expired claims to the ready list. A message is not
//! claimable while an earlier message with the same detection id is leased.

use super::{PendingMessage, PipelineQueue, QueueDepth, QueueMessage, Topic};
use crate::dlq::{should_dead_letter, DeadLetter, DlqHandler, MemoryDlqHandler, REASON_MAX_ATTEMPTS};
use crate::error::{Result, SentinelError};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Entry {
    seq: u64,
    message: QueueMessage,
}

struct Claim {
    lease_id: u64,
    claimed_at: Instant,
    entry: Entry,
}

#[derive(Default)]
struct TopicState {
    ready: VecDeque<Entry>,
    in_flight: HashMap<String, Claim>,
}

impl TopicState {
    fn push_ordered(&mut self, entry: Entry) {
        match self.ready.iter().position(|e| e.seq > entry.seq) {
            Some(idx) => self.ready.insert(idx, entry),
            None => self.ready.push_back(entry),
        }
    }

    fn requeue_expired(&mut self, now: Instant, lease: Duration) -> usize {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, c)| now.duration_since(c.claimed_at) >= lease)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(claim) = self.in_flight.remove(id) {
                tracing::debug!(
                    message_id = %id,
                    detection_id = %claim.entry.message.detection_id,
                    attempt_count = claim.entry.message.attempt_count,
                    "Lease expired, message requeued"
                );
                self.push_ordered(claim.entry);
            }
        }
        expired.len()
    }

    /// Next ready entry whose key has no message in flight
    fn take_claimable(&mut self) -> Option<Entry> {
        let busy: HashSet<&str> = self
            .in_flight
            .values()
            .map(|c| c.entry.message.detection_id.as_str())
            .collect();
        let idx = self
            .ready
            .iter()
            .position(|e| !busy.contains(e.message.detection_id.as_str()))?;
        self.ready.remove(idx)
    }
}

struct Inner {
    topics: Mutex<HashMap<Topic, TopicState>>,
    notifiers: [Notify; 3],
    published: [AtomicU64; 3],
    dlq: Arc<dyn DlqHandler>,
    lease: Duration,
    max_attempts: u32,
    next_seq: AtomicU64,
    next_lease: AtomicU64,
}

impl Inner {
    fn topics(&self) -> Result<MutexGuard<'_, HashMap<Topic, TopicState>>> {
        self.topics
            .lock()
            .map_err(|_| SentinelError::Unavailable("memory queue lock poisoned".to_string()))
    }

    async fn ack(&self, topic: Topic, message_id: &str, lease_id: u64) -> Result<()> {
        let mut topics = self.topics()?;
        let state = topics.entry(topic).or_default();
        match state.in_flight.get(message_id).map(|c| c.lease_id) {
            Some(holder) if holder == lease_id => {
                state.in_flight.remove(message_id);
            }
            Some(_) => {
                tracing::debug!(message_id, "Stale ack ignored, message claimed by another lease");
            }
            None => {
                // Lease expired and the message went back to ready: the work is done
                state.ready.retain(|e| e.message.message_id != message_id);
            }
        }
        Ok(())
    }

    async fn nak(&self, topic: Topic, message_id: &str, lease_id: u64) -> Result<()> {
        {
            let mut topics = self.topics()?;
            let state = topics.entry(topic).or_default();
            if !matches!(state.in_flight.get(message_id), Some(c) if c.lease_id == lease_id) {
                return Ok(());
            }
            if let Some(claim) = state.in_flight.remove(message_id) {
                state.push_ordered(claim.entry);
            }
        }
        self.notifiers[topic.index()].notify_one();
        Ok(())
    }

    async fn dead_letter(
        &self,
        topic: Topic,
        message_id: &str,
        lease_id: u64,
        reason: String,
    ) -> Result<()> {
        let message = {
            let mut topics = self.topics()?;
            let state = topics.entry(topic).or_default();
            match state.in_flight.get(message_id) {
                Some(c) if c.lease_id == lease_id => c.entry.message.clone(),
                _ => return Ok(()),
            }
        };

        // Released only after the dead letter is recorded
        self.dlq.handle(DeadLetter::new(message, reason)).await?;
        {
            let mut topics = self.topics()?;
            let state = topics.entry(topic).or_default();
            if matches!(state.in_flight.get(message_id), Some(c) if c.lease_id == lease_id) {
                state.in_flight.remove(message_id);
            }
        }
        self.notifiers[topic.index()].notify_one();
        Ok(())
    }
}

/// In-memory pipeline queue
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(lease: Duration, max_attempts: u32) -> Self {
        Self::with_dlq(lease, max_attempts, Arc::new(MemoryDlqHandler::default()))
    }

    pub fn with_dlq(lease: Duration, max_attempts: u32, dlq: Arc<dyn DlqHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                notifiers: [Notify::new(), Notify::new(), Notify::new()],
                published: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
                dlq,
                lease,
                max_attempts,
                next_seq: AtomicU64::new(0),
                next_lease: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &crate::config::QueueConfig) -> Self {
        Self::with_dlq(
            config.lease(),
            config.max_attempts,
            Arc::new(MemoryDlqHandler::new(config.dlq_capacity)),
        )
    }

    /// Total messages ever published to a topic
    pub fn published(&self, topic: Topic) -> u64 {
        self.inner.published[topic.index()].load(Ordering::Relaxed)
    }

    /// Claim one message without waiting, dead-lettering any over the limit
    async fn try_claim(&self, topic: Topic) -> Result<Option<PendingMessage>> {
        loop {
            let (message, lease_id) = {
                let mut topics = self.inner.topics()?;
                let state = topics.entry(topic).or_default();
                state.requeue_expired(Instant::now(), self.inner.lease);

                let Some(mut entry) = state.take_claimable() else {
                    return Ok(None);
                };
                entry.message.attempt_count += 1;

                let lease_id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
                let message = entry.message.clone();
                state.in_flight.insert(
                    message.message_id.clone(),
                    Claim {
                        lease_id,
                        claimed_at: Instant::now(),
                        entry,
                    },
                );
                (message, lease_id)
            };

            if should_dead_letter(message.attempt_count, self.inner.max_attempts) {
                let reason = REASON_MAX_ATTEMPTS.to_string();
                self.inner
                    .dead_letter(topic, &message.message_id, lease_id, reason)
                    .await?;
                continue;
            }

            return Ok(Some(self.pending(topic, message, lease_id)));
        }
    }

    fn pending(&self, topic: Topic, message: QueueMessage, lease_id: u64) -> PendingMessage {
        let id_ack = message.message_id.clone();
        let id_nak = message.message_id.clone();
        let id_dlq = message.message_id.clone();
        let inner_ack = self.inner.clone();
        let inner_nak = self.inner.clone();
        let inner_dlq = self.inner.clone();

        PendingMessage::new(
            message,
            move || async move { inner_ack.ack(topic, &id_ack, lease_id).await }.boxed(),
            move || async move { inner_nak.nak(topic, &id_nak, lease_id).await }.boxed(),
            move |reason| {
                async move { inner_dlq.dead_letter(topic, &id_dlq, lease_id, reason).await }.boxed()
            },
        )
    }
}

#[async_trait]
impl PipelineQueue for MemoryQueue {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let topic = message.topic;
        {
            let mut topics = self.inner.topics()?;
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                message_id = %message.message_id,
                detection_id = %message.detection_id,
                topic = %topic,
                "Message published"
            );
            topics.entry(topic).or_default().ready.push_back(Entry { seq, message });
        }
        self.inner.published[topic.index()].fetch_add(1, Ordering::Relaxed);
        self.inner.notifiers[topic.index()].notify_one();
        Ok(())
    }

    async fn claim(&self, topic: Topic, wait: Duration) -> Result<Option<PendingMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(pending) = self.try_claim(topic).await? {
                return Ok(Some(pending));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake on publish or release; re-check at least once per lease for expiries
            let nap = (deadline - now).min(self.inner.lease);
            let _ = tokio::time::timeout(nap, self.inner.notifiers[topic.index()].notified()).await;
        }
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let requeued: Vec<(Topic, usize)> = {
            let mut topics = self.inner.topics()?;
            let now = Instant::now();
            topics
                .iter_mut()
                .map(|(topic, state)| (*topic, state.requeue_expired(now, self.inner.lease)))
                .collect()
        };

        let mut total = 0;
        for (topic, count) in requeued {
            if count > 0 {
                self.inner.notifiers[topic.index()].notify_one();
            }
            total += count;
        }
        Ok(total)
    }

    async fn depth(&self, topic: Topic) -> Result<QueueDepth> {
        let (ready, in_flight) = {
            let topics = self.inner.topics()?;
            topics
                .get(&topic)
                .map(|s| (s.ready.len() as u64, s.in_flight.len() as u64))
                .unwrap_or_default()
        };
        let dead_lettered = self.inner.dlq.count_topic(topic).await? as u64;
        Ok(QueueDepth {
            ready,
            in_flight,
            dead_lettered,
        })
    }

    fn dlq(&self) -> Arc<dyn DlqHandler> {
        self.inner.dlq.clone()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    fn msg(key: &str) -> QueueMessage {
        QueueMessage::new(Topic::Detections, key, serde_json::json!({"key": key}))
    }

    #[tokio::test]
    async fn test_publish_claim_ack() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        queue.publish(msg("det-1")).await.unwrap();

        let pending = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(pending.message.detection_id, "det-1");
        assert_eq!(pending.message.attempt_count, 1);
        assert_eq!(
            queue.depth(Topic::Detections).await.unwrap(),
            QueueDepth {
                ready: 0,
                in_flight: 1,
                dead_lettered: 0
            }
        );

        pending.ack().await.unwrap();
        assert_eq!(queue.depth(Topic::Detections).await.unwrap(), QueueDepth::default());
        assert!(queue.claim(Topic::Detections, WAIT).await.unwrap().is_none());
        assert_eq!(queue.published(Topic::Detections), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        queue.publish(msg("det-1")).await.unwrap();
        assert!(queue.claim(Topic::Alerts, WAIT).await.unwrap().is_none());
        assert!(queue.claim(Topic::Detections, WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_higher_attempt() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        queue.publish(msg("det-1")).await.unwrap();

        let first = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        first.nak().await.unwrap();

        let second = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(second.message.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers() {
        let queue = MemoryQueue::new(Duration::from_millis(30), 5);
        queue.publish(msg("det-1")).await.unwrap();

        let first = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        // Leased: invisible to others
        assert!(queue.claim(Topic::Detections, Duration::ZERO).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(second.message.message_id, first.message.message_id);
        assert_eq!(second.message.attempt_count, 2);

        // The first holder's late ack must not drop the second claim
        first.ack().await.unwrap();
        assert_eq!(queue.depth(Topic::Detections).await.unwrap().in_flight, 1);
        second.ack().await.unwrap();
        assert_eq!(queue.depth(Topic::Detections).await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_late_ack_after_requeue_completes_message() {
        let queue = MemoryQueue::new(Duration::from_millis(10), 5);
        queue.publish(msg("det-1")).await.unwrap();
        let pending = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.requeue_expired().await.unwrap(), 1);
        assert_eq!(queue.depth(Topic::Detections).await.unwrap().ready, 1);

        pending.ack().await.unwrap();
        assert_eq!(queue.depth(Topic::Detections).await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_per_key_ordering() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        queue.publish(msg("det-a")).await.unwrap();
        queue.publish(msg("det-a")).await.unwrap();
        queue.publish(msg("det-b")).await.unwrap();

        let a1 = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(a1.message.detection_id, "det-a");

        // Second det-a is blocked behind the first; det-b is free
        let b = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(b.message.detection_id, "det-b");
        assert!(queue.claim(Topic::Detections, Duration::ZERO).await.unwrap().is_none());

        a1.ack().await.unwrap();
        let a2 = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(a2.message.detection_id, "det-a");
    }

    #[tokio::test]
    async fn test_max_attempts_dead_letters() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 2);
        queue.publish(msg("det-1")).await.unwrap();

        for _ in 0..2 {
            let pending = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
            pending.nak().await.unwrap();
        }

        assert!(queue.claim(Topic::Detections, WAIT).await.unwrap().is_none());
        let dead = queue.dlq().list(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, REASON_MAX_ATTEMPTS);
        assert_eq!(dead[0].message.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_explicit_dead_letter() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        queue.publish(msg("det-1")).await.unwrap();

        let pending = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        pending.dead_letter("token_revoked").await.unwrap();

        let depth = queue.depth(Topic::Detections).await.unwrap();
        assert_eq!((depth.ready, depth.in_flight, depth.dead_lettered), (0, 0, 1));
        let dead = queue.dlq().list(1).await.unwrap();
        assert_eq!(dead[0].reason, "token_revoked");
    }

    #[tokio::test]
    async fn test_full_dlq_keeps_message_leased() {
        let dlq = Arc::new(MemoryDlqHandler::new(1));
        let queue = MemoryQueue::with_dlq(Duration::from_millis(30), 5, dlq.clone());
        let occupant = msg("det-old");
        dlq.handle(DeadLetter::new(occupant.clone(), "token_revoked"))
            .await
            .unwrap();

        queue.publish(msg("det-1")).await.unwrap();
        let pending = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert!(pending.dead_letter("forbidden").await.is_err());

        // Still held, never dropped
        let depth = queue.depth(Topic::Detections).await.unwrap();
        assert_eq!((depth.ready, depth.in_flight, depth.dead_lettered), (0, 1, 1));

        dlq.remove(&occupant.message_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();
        assert_eq!(again.message.detection_id, "det-1");
        assert_eq!(again.message.attempt_count, 2);
        again.dead_letter("forbidden").await.unwrap();
        assert_eq!(dlq.list(1).await.unwrap()[0].message.detection_id, "det-1");
    }

    #[tokio::test]
    async fn test_claim_wakes_on_publish() {
        let queue = MemoryQueue::new(Duration::from_secs(30), 5);
        let consumer = queue.clone();
        let waiter = tokio::spawn(async move {
            consumer.claim(Topic::Detections, Duration::from_secs(2)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(msg("det-1")).await.unwrap();

        let pending = waiter.await.unwrap().unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn test_sweeper_requeues() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10), 5));
        queue.publish(msg("det-1")).await.unwrap();
        let _held = queue.claim(Topic::Detections, WAIT).await.unwrap().unwrap();

        let sweeper = crate::queue::spawn_sweeper(queue.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        sweeper.abort();

        assert_eq!(queue.depth(Topic::Detections).await.unwrap().ready, 1);
    }
}
