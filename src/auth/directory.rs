//! Principal directory: users with password hashes and service accounts

use crate::auth::rbac;
use crate::config::{AuthConfig, ServiceAccount, UserAccount};
use crate::error::{Result, SentinelError};
use crate::types::{Permission, Principal, Role};
use base64::engine::general_purpose::STANDARD_NO_PAD as B64;
use base64::Engine;
use ring::rand::SecureRandom;
use std::collections::HashMap;
use std::num::NonZeroU32;

/// PBKDF2 iterations for newly hashed passwords
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

/// Hash a password as `pbkdf2-sha256$<iterations>$<salt>$<hash>`
pub fn hash_password(password: &str, iterations: u32) -> Result<String> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| SentinelError::Config("PBKDF2 iterations must be > 0".to_string()))?;

    let mut salt = [0u8; SALT_LEN];
    ring::rand::SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| SentinelError::Unavailable("system RNG failure".to_string()))?;

    let mut hash = [0u8; HASH_LEN];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut hash,
    );

    Ok(format!(
        "{}${}${}${}",
        HASH_SCHEME,
        iterations,
        B64.encode(salt),
        B64.encode(hash)
    ))
}

/// Constant-time check of a password against an encoded hash
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let parts: Vec<&str> = encoded.split('$').collect();
    if parts.len() != 4 || parts[0] != HASH_SCHEME {
        return false;
    }
    let Some(iterations) = parts[1].parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (B64.decode(parts[2]), B64.decode(parts[3])) else {
        return false;
    };

    ring::pbkdf2::verify(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

/// Resolved principal plus the scopes its tokens carry
#[derive(Debug, Clone)]
pub struct Grant {
    pub principal: Principal,
    pub scopes: Vec<Permission>,
}

/// Users and service accounts known to the authority
#[derive(Debug, Clone, Default)]
pub struct Directory {
    users: HashMap<String, UserAccount>,
    services: HashMap<String, ServiceAccount>,
}

impl Directory {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut directory = Self::default();
        for user in &config.users {
            directory.add_user(user.clone())?;
        }
        for service in &config.services {
            directory.add_service(service.clone());
        }
        Ok(directory)
    }

    pub fn add_user(&mut self, user: UserAccount) -> Result<()> {
        if user.role == Role::Service {
            return Err(SentinelError::Config(format!(
                "User '{}' cannot hold the service role",
                user.username
            )));
        }
        self.users.insert(user.username.clone(), user);
        Ok(())
    }

    pub fn add_service(&mut self, service: ServiceAccount) {
        self.services.insert(service.name.clone(), service);
    }

    /// Check a username/password pair
    pub fn authenticate_user(&self, username: &str, password: &str) -> Result<Grant> {
        let user = self
            .users
            .get(username)
            .filter(|u| verify_password(password, &u.password_hash))
            .ok_or_else(|| SentinelError::Unauthenticated("invalid credentials".to_string()))?;

        Ok(Grant {
            principal: Principal::user(&user.username, user.role),
            scopes: rbac::permissions_for(user.role).to_vec(),
        })
    }

    /// The grant configured for a service name
    pub fn service(&self, name: &str) -> Option<Grant> {
        self.services.get(name).map(|s| Grant {
            principal: Principal::service(&s.name, s.role),
            scopes: rbac::clamp_scopes(s.role, s.scopes.as_deref()),
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalKind;

    const FAST: u32 = 1_000;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("operator123", FAST).unwrap();
        assert!(hash.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify_password("operator123", &hash));
        assert!(!verify_password("operator124", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_password("same", FAST).unwrap();
        let b = hash_password("same", FAST).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "plaintext"));
        assert!(!verify_password("x", "pbkdf2-sha256$0$AAAA$AAAA"));
        assert!(!verify_password("x", "bcrypt$10$AAAA$AAAA"));
    }

    #[test]
    fn test_authenticate_user() {
        let mut directory = Directory::default();
        directory
            .add_user(UserAccount {
                username: "viewer".into(),
                password_hash: hash_password("viewer123", FAST).unwrap(),
                role: Role::Viewer,
            })
            .unwrap();

        let grant = directory.authenticate_user("viewer", "viewer123").unwrap();
        assert_eq!(grant.principal.kind, PrincipalKind::User);
        assert_eq!(grant.scopes, vec![Permission::Read]);

        assert!(matches!(
            directory.authenticate_user("viewer", "nope"),
            Err(SentinelError::Unauthenticated(_))
        ));
        assert!(matches!(
            directory.authenticate_user("ghost", "viewer123"),
            Err(SentinelError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_user_service_role_rejected() {
        let mut directory = Directory::default();
        let result = directory.add_user(UserAccount {
            username: "sneaky".into(),
            password_hash: String::new(),
            role: Role::Service,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_service_scopes_configured() {
        let mut directory = Directory::default();
        directory.add_service(ServiceAccount {
            name: "reporter".into(),
            role: Role::Service,
            scopes: Some(vec![Permission::Read, Permission::Manage]),
        });

        let grant = directory.service("reporter").unwrap();
        assert_eq!(grant.principal.kind, PrincipalKind::Service);
        assert_eq!(grant.scopes, vec![Permission::Read]);
        assert!(directory.service("unknown").is_none());
    }

    #[test]
    fn test_default_services_loaded() {
        let directory = Directory::from_config(&AuthConfig::default()).unwrap();
        assert_eq!(
            directory.service_names(),
            vec![
                "alert-service",
                "api-gateway",
                "cv-detection-service",
                "ml-classification-service"
            ]
        );
    }
}
