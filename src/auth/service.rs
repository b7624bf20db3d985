//! Self-refreshing service credential
//!
//! Pipeline stages authenticate as service principals. A `ServiceCredential`
//! holds the stage's current token and re-mints it through the authority
//! (using the token itself as the bearer) shortly before it expires. An idle
//! stage keeps its credential alive through [`ServiceCredential::spawn_refresh`].
//!
//! Failures of the stage's own credential surface as `Unavailable`: they say
//! nothing about the message being processed, so the message is retried
//! rather than dead-lettered.

use super::{now_secs, Token, TokenAuthority};
use crate::error::{Result, SentinelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Pause before retrying a failed background refresh
const REFRESH_RETRY: Duration = Duration::from_secs(1);

pub struct ServiceCredential {
    authority: Arc<TokenAuthority>,
    service_name: String,
    current: RwLock<Token>,
    refresh_margin: Duration,
}

impl ServiceCredential {
    /// Mint the first token using a bearer allowed to mint for this service
    pub async fn bootstrap(
        authority: Arc<TokenAuthority>,
        service_name: impl Into<String>,
        minting_bearer: &str,
        refresh_margin: Duration,
    ) -> Result<Self> {
        let service_name = service_name.into();
        let token = authority.service_token(&service_name, minting_bearer).await?;
        Ok(Self {
            authority,
            service_name,
            current: RwLock::new(token),
            refresh_margin,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Current bearer string, refreshed if it is inside the refresh margin
    pub async fn bearer(&self) -> Result<String> {
        let now = now_secs();
        {
            let token = self.current.read().await;
            if !self.due(&token, now) {
                return Ok(token.as_str().to_string());
            }
        }

        let mut token = self.current.write().await;
        // Another task may have refreshed while we waited for the lock
        if !self.due(&token, now) {
            return Ok(token.as_str().to_string());
        }
        self.remint(&mut token, now).await?;
        Ok(token.as_str().to_string())
    }

    /// Re-mint now, regardless of the margin
    pub async fn refresh(&self) -> Result<()> {
        let mut token = self.current.write().await;
        self.remint(&mut token, now_secs()).await
    }

    pub async fn token_id(&self) -> String {
        self.current.read().await.token_id().to_string()
    }

    /// Unix seconds at which the current token expires
    pub async fn expires_at(&self) -> i64 {
        self.current.read().await.expires_at()
    }

    /// Keep the credential fresh while the owning stage is idle
    ///
    /// Wakes at `expires_at - refresh_margin` and re-mints, at most once per
    /// `REFRESH_RETRY`. Stops once the token has expired, since an expired
    /// token cannot mint its successor.
    pub fn spawn_refresh(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut floor = Duration::ZERO;
            loop {
                let due_ms = (self.expires_at().await - self.margin_secs()) * 1000;
                let wait_ms = (due_ms - chrono::Utc::now().timestamp_millis()).max(0);
                let wait = Duration::from_millis(wait_ms as u64).max(floor);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                floor = REFRESH_RETRY;

                match self.refresh().await {
                    Ok(()) => {}
                    Err(e) if self.expires_at().await <= now_secs() => {
                        tracing::error!(
                            service = %self.service_name,
                            error = %e,
                            "Service token expired, refresh stopped"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            service = %self.service_name,
                            error = %e,
                            "Service token refresh failed"
                        );
                    }
                }
            }
        })
    }

    fn margin_secs(&self) -> i64 {
        self.refresh_margin.as_secs() as i64
    }

    fn due(&self, token: &Token, now: i64) -> bool {
        token.expires_at() - self.margin_secs() <= now
    }

    async fn remint(&self, token: &mut Token, now: i64) -> Result<()> {
        if token.expires_at() <= now {
            return Err(SentinelError::Unavailable(format!(
                "service token for '{}' expired before refresh",
                self.service_name
            )));
        }

        let fresh = self
            .authority
            .service_token(&self.service_name, token.as_str())
            .await
            .map_err(|e| {
                SentinelError::Unavailable(format!(
                    "service token refresh for '{}' failed: {}",
                    self.service_name, e
                ))
            })?;
        tracing::debug!(
            service = %self.service_name,
            old_token_id = %token.token_id(),
            new_token_id = %fresh.token_id(),
            "Service token refreshed"
        );
        *token = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::test_authority;
    use crate::types::Role;

    #[tokio::test]
    async fn test_bootstrap_and_bearer() {
        let authority = Arc::new(test_authority());
        let admin = authority.login("admin", "admin123").await.unwrap();

        let credential = ServiceCredential::bootstrap(
            authority.clone(),
            "cv-detection-service",
            admin.as_str(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let bearer = credential.bearer().await.unwrap();
        let identity = authority.validate(&bearer).await.unwrap();
        assert_eq!(identity.subject, "cv-detection-service");
        assert_eq!(identity.role, Role::Service);

        // Well outside the margin: same token
        assert_eq!(credential.bearer().await.unwrap(), bearer);
    }

    #[tokio::test]
    async fn test_refresh_inside_margin() {
        let authority = Arc::new(test_authority());
        let admin = authority.login("admin", "admin123").await.unwrap();

        // Margin larger than the TTL forces a refresh on every call
        let credential = ServiceCredential::bootstrap(
            authority.clone(),
            "ml-classification-service",
            admin.as_str(),
            authority.token_ttl() + Duration::from_secs(1),
        )
        .await
        .unwrap();

        let first_id = credential.token_id().await;
        let bearer = credential.bearer().await.unwrap();
        assert_ne!(credential.token_id().await, first_id);
        assert!(authority.validate(&bearer).await.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_requires_minting_right() {
        let authority = Arc::new(test_authority());
        let viewer = authority.login("viewer", "viewer123").await.unwrap();
        let result = ServiceCredential::bootstrap(
            authority,
            "cv-detection-service",
            viewer.as_str(),
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(SentinelError::Forbidden(_))));
    }

    fn short_lived_authority(ttl_secs: u64) -> Arc<TokenAuthority> {
        let mut config = crate::auth::tests::test_config();
        config.token_ttl_secs = ttl_secs;
        config.revocation_ttl_secs = ttl_secs;
        Arc::new(
            TokenAuthority::new(&config, Arc::new(crate::auth::MemoryCredentialStore::new()))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_expired_credential_is_retryable() {
        let authority = short_lived_authority(1);
        let admin = authority.login("admin", "admin123").await.unwrap();
        let credential = ServiceCredential::bootstrap(
            authority,
            "ml-classification-service",
            admin.as_str(),
            Duration::ZERO,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        let err = credential.bearer().await.unwrap_err();
        assert!(matches!(err, SentinelError::Unavailable(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_background_refresh_outlives_ttl() {
        let authority = short_lived_authority(2);
        let admin = authority.login("admin", "admin123").await.unwrap();
        let credential = Arc::new(
            ServiceCredential::bootstrap(
                authority.clone(),
                "alert-service",
                admin.as_str(),
                Duration::from_secs(1),
            )
            .await
            .unwrap(),
        );
        let first_id = credential.token_id().await;

        let refresher = credential.clone().spawn_refresh();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let bearer = credential.bearer().await.unwrap();
        let identity = authority.validate(&bearer).await.unwrap();
        assert_eq!(identity.subject, "alert-service");
        assert_ne!(identity.token_id, first_id);
        refresher.abort();
    }
}
