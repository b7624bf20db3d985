//! Error types for a3s-sentinel

use thiserror::Error;

/// Errors that can occur across the token authority and the pipeline
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Bad credentials at login or token-minting time
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// Malformed token or bad signature
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token is past its `expires_at`
    #[error("Token expired")]
    TokenExpired,

    /// Token id is present in the credential store
    #[error("Token revoked")]
    TokenRevoked,

    /// Authenticated, but lacking the required permission
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown id
    #[error("Not found: {0}")]
    NotFound(String),

    /// External detection model failed or timed out
    #[error("Detection model unavailable: {0}")]
    DetectionUnavailable(String),

    /// External scoring model failed or timed out
    #[error("Scoring model unavailable: {0}")]
    ModelUnavailable(String),

    /// Uniqueness violation; the work was already done
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage or queue outage
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl SentinelError {
    /// Stable machine-readable code, used in authorization decisions and
    /// dead-letter records
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::InvalidToken(_) => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::DetectionUnavailable(_) => "detection_unavailable",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Serialization(_) => "malformed_payload",
            Self::Config(_) => "config",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Failures that redelivery can never fix
    ///
    /// Token and permission problems are structural, and so is a payload
    /// that does not decode. The pipeline dead-letters these immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated(_)
                | Self::InvalidToken(_)
                | Self::TokenExpired
                | Self::TokenRevoked
                | Self::Forbidden(_)
                | Self::Serialization(_)
        )
    }

    /// Uniqueness violation, treated as success-already-done
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for SentinelError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            // Only uniqueness means "already done"; NOT NULL or CHECK failures do not
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(
                    err.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                ) =>
            {
                SentinelError::Conflict(e.to_string())
            }
            other => SentinelError::Unavailable(format!("sqlite: {}", other)),
        }
    }
}

/// Result type alias for sentinel operations
pub type Result<T> = std::result::Result<T, SentinelError>;
