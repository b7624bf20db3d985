//! Signed token codec
//!
//! Tokens are JWT-shaped: `base64url(header).base64url(claims).base64url(signature)`.
//! The signature algorithm is pluggable through [`TokenSigner`]; the default
//! is HMAC-SHA256 (`HS256`) backed by `ring`.

use crate::error::{Result, SentinelError};
use crate::types::{Permission, PrincipalKind, Role};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Algorithm tag for the default signer
pub const ALGORITHM_HS256: &str = "HS256";

/// Signs and verifies the `header.claims` part of a token
pub trait TokenSigner: Send + Sync {
    /// Algorithm tag written into the token header
    fn algorithm(&self) -> &str;

    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Constant-time verification
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// HMAC-SHA256 signer
pub struct HmacSigner {
    key: ring::hmac::Key,
}

impl HmacSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret),
        }
    }
}

impl TokenSigner for HmacSigner {
    fn algorithm(&self) -> &str {
        ALGORITHM_HS256
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        ring::hmac::sign(&self.key, message).as_ref().to_vec()
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        ring::hmac::verify(&self.key, message, signature).is_ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by every token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Unique token id
    pub jti: String,

    /// Principal id
    pub sub: String,

    pub kind: PrincipalKind,

    pub role: Role,

    pub scopes: Vec<Permission>,

    /// Issued at (unix seconds)
    pub iat: i64,

    /// Expires at (unix seconds)
    pub exp: i64,
}

/// An issued token: its claims plus the encoded bearer string
#[derive(Clone)]
pub struct Token {
    claims: TokenClaims,
    algorithm: String,
    encoded: String,
}

impl Token {
    pub(crate) fn new(claims: TokenClaims, algorithm: impl Into<String>, encoded: String) -> Self {
        Self {
            claims,
            algorithm: algorithm.into(),
            encoded,
        }
    }

    pub fn token_id(&self) -> &str {
        &self.claims.jti
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn kind(&self) -> PrincipalKind {
        self.claims.kind
    }

    pub fn role(&self) -> Role {
        self.claims.role
    }

    pub fn scopes(&self) -> &[Permission] {
        &self.claims.scopes
    }

    pub fn issued_at(&self) -> i64 {
        self.claims.iat
    }

    pub fn expires_at(&self) -> i64 {
        self.claims.exp
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// The bearer string presented to other services
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token_id", &self.claims.jti)
            .field("subject", &self.claims.sub)
            .field("role", &self.claims.role)
            .field("expires_at", &self.claims.exp)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Encode and sign claims
pub fn encode(claims: &TokenClaims, signer: &dyn TokenSigner) -> Result<String> {
    let header = Header {
        alg: signer.algorithm().to_string(),
        typ: "JWT".to_string(),
    };
    let signing_input = format!(
        "{}.{}",
        B64.encode(serde_json::to_vec(&header)?),
        B64.encode(serde_json::to_vec(claims)?)
    );
    let signature = signer.sign(signing_input.as_bytes());
    Ok(format!("{}.{}", signing_input, B64.encode(signature)))
}

/// Verify the signature and decode the claims
///
/// Expiry is not checked here. Any structural problem, algorithm mismatch,
/// or bad signature yields `InvalidToken`.
pub fn decode(token: &str, signer: &dyn TokenSigner) -> Result<TokenClaims> {
    let mut parts = token.split('.');
    let segments = (parts.next(), parts.next(), parts.next(), parts.next());
    let (header_b64, claims_b64, sig_b64) = match segments {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(SentinelError::InvalidToken("malformed token".to_string())),
    };

    let header_bytes = B64
        .decode(header_b64)
        .map_err(|_| SentinelError::InvalidToken("bad header encoding".to_string()))?;
    let header: Header = serde_json::from_slice(&header_bytes)
        .map_err(|_| SentinelError::InvalidToken("bad header".to_string()))?;
    if header.alg != signer.algorithm() {
        return Err(SentinelError::InvalidToken(format!(
            "unexpected algorithm '{}'",
            header.alg
        )));
    }

    let signature = B64
        .decode(sig_b64)
        .map_err(|_| SentinelError::InvalidToken("bad signature encoding".to_string()))?;
    let signing_input_len = header_b64.len() + 1 + claims_b64.len();
    if !signer.verify(token[..signing_input_len].as_bytes(), &signature) {
        return Err(SentinelError::InvalidToken("bad signature".to_string()));
    }

    let claims_bytes = B64
        .decode(claims_b64)
        .map_err(|_| SentinelError::InvalidToken("bad claims encoding".to_string()))?;
    serde_json::from_slice(&claims_bytes)
        .map_err(|_| SentinelError::InvalidToken("bad claims".to_string()))
}
