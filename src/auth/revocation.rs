//! Credential store: durable keyed storage of issued and revoked token ids
//!
//! The token authority records every issued token id (so `revoke` can tell
//! unknown ids apart) and every revocation. Both kinds of entry carry an
//! expiry and are evicted once it passes; a revocation entry must outlive
//! the longest token lifetime in flight.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Ledger entry for an issued token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedEntry {
    pub token_id: String,
    pub subject: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// A revoked token id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub token_id: String,
    /// Unix seconds
    pub revoked_at: i64,
    pub ttl_secs: u64,
}

impl RevocationEntry {
    pub fn expires_at(&self) -> i64 {
        self.revoked_at.saturating_add(self.ttl_secs as i64)
    }
}

/// Storage contract used by the token authority
///
/// `is_revoked` sits on the validation hot path and must be O(1).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Record a newly issued token
    async fn record_issued(&self, entry: IssuedEntry) -> Result<()>;

    /// Look up an issued token that has not been evicted
    async fn issued(&self, token_id: &str, now: i64) -> Result<Option<IssuedEntry>>;

    /// Insert a revocation entry (idempotent)
    async fn revoke(&self, entry: RevocationEntry) -> Result<()>;

    /// Whether a live revocation entry exists for the token id
    async fn is_revoked(&self, token_id: &str, now: i64) -> Result<bool>;

    /// Drop entries whose expiry has passed, returning how many were removed
    async fn evict_expired(&self, now: i64) -> Result<usize>;

    /// Store name (e.g., "memory")
    fn name(&self) -> &str;

    /// Health check: defaults to a successful revocation lookup
    async fn health(&self) -> Result<bool> {
        self.is_revoked("health-check", 0).await.map(|_| true)
    }
}

/// In-memory credential store backed by concurrent hash maps
#[derive(Default)]
pub struct MemoryCredentialStore {
    issued: DashMap<String, IssuedEntry>,
    revoked: DashMap<String, RevocationEntry>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn record_issued(&self, entry: IssuedEntry) -> Result<()> {
        self.issued.insert(entry.token_id.clone(), entry);
        Ok(())
    }

    async fn issued(&self, token_id: &str, now: i64) -> Result<Option<IssuedEntry>> {
        Ok(self
            .issued
            .get(token_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value().clone()))
    }

    async fn revoke(&self, entry: RevocationEntry) -> Result<()> {
        // Keep whichever entry expires last
        self.revoked
            .entry(entry.token_id.clone())
            .and_modify(|existing| {
                if entry.expires_at() > existing.expires_at() {
                    *existing = entry.clone();
                }
            })
            .or_insert(entry);
        Ok(())
    }

    async fn is_revoked(&self, token_id: &str, now: i64) -> Result<bool> {
        Ok(self
            .revoked
            .get(token_id)
            .map(|e| e.expires_at() > now)
            .unwrap_or(false))
    }

    async fn evict_expired(&self, now: i64) -> Result<usize> {
        let before = self.issued.len() + self.revoked.len();
        self.issued.retain(|_, e| e.expires_at > now);
        self.revoked.retain(|_, e| e.expires_at() > now);
        let removed = before.saturating_sub(self.issued.len() + self.revoked.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted expired credential entries");
        }
        Ok(removed)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Spawn a task that periodically evicts expired entries
pub fn spawn_eviction(store: Arc<dyn CredentialStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = store.evict_expired(now).await {
                tracing::warn!(store = store.name(), error = %e, "Credential eviction failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revocation(id: &str, at: i64, ttl: u64) -> RevocationEntry {
        RevocationEntry {
            token_id: id.to_string(),
            revoked_at: at,
            ttl_secs: ttl,
        }
    }

    #[tokio::test]
    async fn test_revoke_and_lookup() {
        let store = MemoryCredentialStore::new();
        assert!(!store.is_revoked("t1", 100).await.unwrap());

        store.revoke(revocation("t1", 100, 60)).await.unwrap();
        assert!(store.is_revoked("t1", 100).await.unwrap());
        assert!(store.is_revoked("t1", 159).await.unwrap());
        assert!(!store.is_revoked("t1", 160).await.unwrap());
    }

    #[tokio::test]
    async fn test_repeat_revoke_keeps_longest_window() {
        let store = MemoryCredentialStore::new();
        store.revoke(revocation("t1", 100, 60)).await.unwrap();
        store.revoke(revocation("t1", 50, 60)).await.unwrap();
        assert!(store.is_revoked("t1", 150).await.unwrap());
        assert_eq!(store.revoked_count(), 1);
    }

    #[tokio::test]
    async fn test_issued_ledger() {
        let store = MemoryCredentialStore::new();
        store
            .record_issued(IssuedEntry {
                token_id: "t1".into(),
                subject: "admin".into(),
                expires_at: 200,
            })
            .await
            .unwrap();

        assert_eq!(store.issued("t1", 100).await.unwrap().unwrap().subject, "admin");
        assert!(store.issued("t1", 200).await.unwrap().is_none());
        assert!(store.issued("t2", 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryCredentialStore::new();
        store.revoke(revocation("old", 0, 10)).await.unwrap();
        store.revoke(revocation("new", 100, 10)).await.unwrap();
        store
            .record_issued(IssuedEntry {
                token_id: "old".into(),
                subject: "svc".into(),
                expires_at: 5,
            })
            .await
            .unwrap();

        let removed = store.evict_expired(50).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.revoked_count(), 1);
        assert_eq!(store.issued_count(), 0);
        assert!(store.is_revoked("new", 50).await.unwrap());
    }

    #[tokio::test]
    async fn test_eviction_task_runs() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.revoke(revocation("gone", 0, 1)).await.unwrap();

        let handle = spawn_eviction(store.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(store.revoked_count(), 0);
    }
}
