//! Recent-alerts feed: consumes alert notifications and keeps the newest
//! ones in memory for dashboards

use super::{verify_publisher, Disposition, MessageHandler};
use crate::auth::TokenAuthority;
use crate::error::Result;
use crate::queue::{QueueMessage, Topic};
use crate::types::{Alert, Permission};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bounded, newest-first window over `Topic::Alerts`
pub struct AlertFeed {
    authority: Arc<TokenAuthority>,
    recent: RwLock<VecDeque<Alert>>,
    capacity: usize,
    received: AtomicU64,
}

impl AlertFeed {
    pub fn new(authority: Arc<TokenAuthority>, capacity: usize) -> Self {
        Self {
            authority,
            recent: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            received: AtomicU64::new(0),
        }
    }

    /// Notifications accepted into the window since start
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Up to `limit` alerts, newest first
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.recent.read().await.iter().take(limit).cloned().collect()
    }

    pub async fn recent_as(&self, token: &str, limit: usize) -> Result<Vec<Alert>> {
        self.authority.authorize(token, Permission::Read).await?;
        Ok(self.recent(limit).await)
    }
}

#[async_trait]
impl MessageHandler for AlertFeed {
    fn topic(&self) -> Topic {
        Topic::Alerts
    }

    fn name(&self) -> &str {
        "alert-feed"
    }

    async fn handle(&self, message: &QueueMessage) -> Result<Disposition> {
        verify_publisher(&self.authority, message).await?;
        let alert: Alert = message.decode()?;

        let mut recent = self.recent.write().await;
        // Redelivered notification
        if recent.iter().any(|a| a.alert_id == alert.alert_id) {
            return Ok(Disposition::Ack);
        }
        tracing::debug!(alert_id = %alert.alert_id, "Alert added to feed");
        recent.push_front(alert);
        recent.truncate(self.capacity);
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(Disposition::Ack)
    }
}
