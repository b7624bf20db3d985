//! Token authority: issuance, validation, revocation, and authorization
//!
//! Every other component depends on this module's validation contract.
//!
//! ## Token lifecycle
//!
//! ```text
//! issued --> active --> expired   (exp <= now, checked lazily)
//!                  \--> revoked   (token id in the credential store)
//! ```
//!
//! Validation order is fixed: signature → expiry → revocation lookup. A
//! credential store that fails or exceeds the validation timeout makes
//! validation fail closed with `Forbidden`.

pub mod directory;
pub mod rbac;
pub mod revocation;
pub mod service;
pub mod sqlite;
pub mod token;

pub use directory::{hash_password, verify_password, Directory, Grant};
pub use revocation::{
    spawn_eviction, CredentialStore, IssuedEntry, MemoryCredentialStore, RevocationEntry,
};
pub use service::ServiceCredential;
pub use sqlite::SqliteCredentialStore;
pub use token::{HmacSigner, Token, TokenClaims, TokenSigner};

use crate::config::AuthConfig;
use crate::error::{Result, SentinelError};
use crate::types::{Permission, PrincipalKind, Role};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How a caller asks for a token
pub enum IssueRequest<'a> {
    /// Human login
    Password { username: &'a str, password: &'a str },

    /// Mint a token for a configured service account. The bearer must be a
    /// valid admin token, or the service's own current token.
    Service {
        service_name: &'a str,
        bearer: &'a str,
    },
}

/// The validated identity behind a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub token_id: String,
    pub subject: String,
    pub kind: PrincipalKind,
    pub role: Role,
    pub scopes: Vec<Permission>,
    pub expires_at: i64,
}

impl Identity {
    /// Check a permission against the static role matrix
    pub fn authorize(&self, required: Permission) -> Result<()> {
        rbac::authorize(self.role, &self.scopes, required)
    }

    pub fn is_service(&self) -> bool {
        self.kind == PrincipalKind::Service
    }
}

impl From<&TokenClaims> for Identity {
    fn from(claims: &TokenClaims) -> Self {
        Self {
            token_id: claims.jti.clone(),
            subject: claims.sub.clone(),
            kind: claims.kind,
            role: claims.role,
            scopes: claims.scopes.clone(),
            expires_at: claims.exp,
        }
    }
}

/// Allow/deny decision with a reason code, for callers that want a
/// decision instead of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDecision {
    pub allowed: bool,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Effective permissions behind a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSet {
    pub subject: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub is_service: bool,
}

/// Issues, validates, and revokes signed tokens
pub struct TokenAuthority {
    signer: Arc<dyn TokenSigner>,
    store: Arc<dyn CredentialStore>,
    directory: Directory,
    token_ttl: Duration,
    revocation_ttl: Duration,
    validation_timeout: Duration,
}

impl TokenAuthority {
    /// Build an HMAC-SHA256 authority from configuration
    pub fn new(config: &AuthConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let signer = Arc::new(HmacSigner::new(config.signing_secret.as_bytes()));
        Self::with_signer(config, store, signer)
    }

    /// Build an authority with a custom signature algorithm
    pub fn with_signer(
        config: &AuthConfig,
        store: Arc<dyn CredentialStore>,
        signer: Arc<dyn TokenSigner>,
    ) -> Result<Self> {
        if config.signing_secret.len() < crate::config::MIN_SECRET_LEN {
            return Err(SentinelError::Config(format!(
                "Signing secret must be at least {} bytes",
                crate::config::MIN_SECRET_LEN
            )));
        }
        if config.token_ttl_secs == 0 {
            return Err(SentinelError::Config(
                "Token TTL must be greater than zero".to_string(),
            ));
        }
        if config.revocation_ttl_secs < config.token_ttl_secs {
            return Err(SentinelError::Config(
                "Revocation TTL must cover the token lifetime".to_string(),
            ));
        }

        Ok(Self {
            signer,
            store,
            directory: Directory::from_config(config)?,
            token_ttl: config.token_ttl(),
            revocation_ttl: config.revocation_ttl(),
            validation_timeout: config.validation_timeout(),
        })
    }

    /// Issue a token for a user login or a service request
    pub async fn issue(&self, request: IssueRequest<'_>) -> Result<Token> {
        let grant = match request {
            IssueRequest::Password { username, password } => {
                let grant = self.directory.authenticate_user(username, password);
                if let Err(ref e) = grant {
                    tracing::warn!(username, reason = e.reason_code(), "Login rejected");
                }
                grant?
            }
            IssueRequest::Service {
                service_name,
                bearer,
            } => self.service_grant(service_name, bearer).await?,
        };

        self.mint(grant).await
    }

    /// Convenience wrapper for a password login
    pub async fn login(&self, username: &str, password: &str) -> Result<Token> {
        self.issue(IssueRequest::Password { username, password }).await
    }

    /// Convenience wrapper for minting a service token
    pub async fn service_token(&self, service_name: &str, bearer: &str) -> Result<Token> {
        self.issue(IssueRequest::Service {
            service_name,
            bearer,
        })
        .await
    }

    async fn service_grant(&self, service_name: &str, bearer: &str) -> Result<Grant> {
        let caller = self.validate(bearer).await.map_err(|e| {
            tracing::warn!(
                service = service_name,
                reason = e.reason_code(),
                "Service token request rejected"
            );
            SentinelError::Unauthenticated(format!("caller token rejected: {}", e.reason_code()))
        })?;

        let grant = self.directory.service(service_name).ok_or_else(|| {
            SentinelError::Unauthenticated(format!("unknown service '{}'", service_name))
        })?;

        match caller.role {
            Role::Admin => {}
            Role::Service if caller.subject == service_name => {}
            Role::Service => {
                return Err(SentinelError::Forbidden(format!(
                    "service '{}' cannot mint tokens for '{}'",
                    caller.subject, service_name
                )))
            }
            other => {
                return Err(SentinelError::Forbidden(format!(
                    "role '{}' cannot mint service tokens",
                    other
                )))
            }
        }

        Ok(grant)
    }

    async fn mint(&self, grant: Grant) -> Result<Token> {
        let now = now_secs();
        let claims = TokenClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: grant.principal.id,
            kind: grant.principal.kind,
            role: grant.principal.role,
            scopes: grant.scopes,
            iat: now,
            exp: now + self.token_ttl.as_secs() as i64,
        };
        let encoded = token::encode(&claims, self.signer.as_ref())?;

        self.store
            .record_issued(IssuedEntry {
                token_id: claims.jti.clone(),
                subject: claims.sub.clone(),
                expires_at: claims.exp,
            })
            .await?;

        tracing::info!(
            token_id = %claims.jti,
            subject = %claims.sub,
            role = %claims.role,
            expires_at = claims.exp,
            "Token issued"
        );

        Ok(Token::new(claims, self.signer.algorithm(), encoded))
    }

    /// Validate a bearer token at the current time
    pub async fn validate(&self, token: &str) -> Result<Identity> {
        self.validate_at(token, now_secs()).await
    }

    /// Validate a bearer token as of `now` (unix seconds)
    pub async fn validate_at(&self, token: &str, now: i64) -> Result<Identity> {
        let claims = token::decode(token, self.signer.as_ref())?;

        if claims.exp <= now {
            return Err(SentinelError::TokenExpired);
        }

        let lookup = tokio::time::timeout(
            self.validation_timeout,
            self.store.is_revoked(&claims.jti, now),
        )
        .await;

        match lookup {
            Ok(Ok(false)) => Ok(Identity::from(&claims)),
            Ok(Ok(true)) => Err(SentinelError::TokenRevoked),
            Ok(Err(e)) => {
                tracing::warn!(
                    token_id = %claims.jti,
                    error = %e,
                    "Credential store lookup failed, denying"
                );
                Err(SentinelError::Forbidden(
                    "credential store unavailable".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!(
                    token_id = %claims.jti,
                    timeout_ms = self.validation_timeout.as_millis() as u64,
                    "Credential store lookup timed out, denying"
                );
                Err(SentinelError::Forbidden(
                    "credential store unavailable".to_string(),
                ))
            }
        }
    }

    /// Revoke a token id on behalf of a validated actor
    ///
    /// Admins may revoke any token; anyone may revoke their own.
    pub async fn revoke(&self, token_id: &str, actor: &Identity) -> Result<()> {
        let now = now_secs();
        let entry = self
            .store
            .issued(token_id, now)
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("token '{}'", token_id)))?;

        let is_admin = actor.authorize(Permission::Manage).is_ok();
        if !is_admin && entry.subject != actor.subject {
            return Err(SentinelError::Forbidden(format!(
                "'{}' may not revoke tokens of '{}'",
                actor.subject, entry.subject
            )));
        }

        self.store
            .revoke(RevocationEntry {
                token_id: token_id.to_string(),
                revoked_at: now,
                ttl_secs: self.revocation_ttl.as_secs(),
            })
            .await?;

        tracing::info!(token_id, actor = %actor.subject, "Token revoked");
        Ok(())
    }

    /// Validate a token and require a permission
    pub async fn authorize(&self, token: &str, required: Permission) -> Result<Identity> {
        let identity = self.validate(token).await?;
        identity.authorize(required)?;
        Ok(identity)
    }

    /// Same as [`authorize`](Self::authorize), but as a decision with a reason code
    pub async fn check(&self, token: &str, required: Permission) -> AuthDecision {
        match self.authorize(token, required).await {
            Ok(identity) => AuthDecision {
                allowed: true,
                reason: "ok",
                subject: Some(identity.subject),
            },
            Err(e) => AuthDecision {
                allowed: false,
                reason: e.reason_code(),
                subject: None,
            },
        }
    }

    /// Introspect what a token may do
    pub async fn permissions(&self, token: &str) -> Result<PermissionSet> {
        let identity = self.validate(token).await?;
        let permissions = rbac::permissions_for(identity.role)
            .iter()
            .copied()
            .filter(|p| identity.scopes.contains(p))
            .collect();
        Ok(PermissionSet {
            is_service: identity.is_service(),
            subject: identity.subject,
            role: identity.role,
            permissions,
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }
}

/// Current time in unix seconds
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
