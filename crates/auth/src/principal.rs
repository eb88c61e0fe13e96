use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{JwtClaims, Permission, Role};

/// Identity of an authenticated caller (human operator or service account).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A resolved caller: identity plus effective permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub name: Option<String>,
    pub roles: Vec<Role>,
    /// Role-derived plus directly granted permissions.
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn from_claims(claims: &JwtClaims) -> Self {
        let mut permissions: Vec<Permission> =
            claims.roles.iter().flat_map(Role::permissions).collect();
        for p in &claims.permissions {
            if !permissions.contains(p) {
                permissions.push(p.clone());
            }
        }

        Self {
            principal_id: claims.sub,
            name: claims.name.clone(),
            roles: claims.roles.clone(),
            permissions,
        }
    }

    /// Caller identity used for rate-limit keys and audit `user_id`.
    pub fn actor(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.principal_id.to_string(),
        }
    }
}
