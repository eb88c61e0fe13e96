use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier carried in tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const OPERATOR: Role = Role(Cow::Borrowed("operator"));
    pub const VIEWER: Role = Role(Cow::Borrowed("viewer"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Static role → permission mapping.
    ///
    /// `admin` holds the wildcard; `operator` may dispatch and read the
    /// ledger; `viewer` may only read. Unknown roles grant nothing.
    pub fn permissions(&self) -> Vec<Permission> {
        match self.as_str() {
            "admin" => vec![Permission::WILDCARD],
            "operator" => vec![Permission::DISPATCH_EXECUTE, Permission::LOGS_READ],
            "viewer" => vec![Permission::LOGS_READ],
            _ => Vec::new(),
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
