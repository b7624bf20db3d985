//! Static role → permission matrix
//!
//! The only place permissions are derived from roles. Every check in the
//! crate goes through [`authorize`].

use crate::error::{Result, SentinelError};
use crate::types::{Permission, Role};

const ADMIN: &[Permission] = &[
    Permission::Read,
    Permission::Write,
    Permission::Delete,
    Permission::Manage,
];
const OPERATOR: &[Permission] = &[Permission::Read, Permission::Write];
const VIEWER: &[Permission] = &[Permission::Read];
const SERVICE: &[Permission] = &[Permission::Read, Permission::Write];

/// Permissions granted to a role
pub fn permissions_for(role: Role) -> &'static [Permission] {
    match role {
        Role::Admin => ADMIN,
        Role::Operator => OPERATOR,
        Role::Viewer => VIEWER,
        Role::Service => SERVICE,
    }
}

/// Allow only if the role grants `required` and the token's scopes include it
///
/// Scopes can narrow a role but never widen it.
pub fn authorize(role: Role, scopes: &[Permission], required: Permission) -> Result<()> {
    if !permissions_for(role).contains(&required) {
        return Err(SentinelError::Forbidden(format!(
            "role '{}' lacks '{}'",
            role, required
        )));
    }
    if !scopes.contains(&required) {
        return Err(SentinelError::Forbidden(format!(
            "token scopes lack '{}'",
            required
        )));
    }
    Ok(())
}

/// Intersect requested scopes with what the role allows
pub fn clamp_scopes(role: Role, requested: Option<&[Permission]>) -> Vec<Permission> {
    let allowed = permissions_for(role);
    match requested {
        Some(scopes) => {
            let mut clamped: Vec<Permission> = scopes
                .iter()
                .copied()
                .filter(|p| allowed.contains(p))
                .collect();
            clamped.sort();
            clamped.dedup();
            clamped
        }
        None => allowed.to_vec(),
    }
}
