use dispatchgate_auth::{Permission, Principal, PrincipalId, Role, is_privileged};

/// Authenticated caller for a request.
///
/// Inserted by the auth middleware; present on every protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal: Principal,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal.principal_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.principal.roles
    }

    /// Identity recorded in the ledger and used as the rate-limit key.
    pub fn actor(&self) -> String {
        self.principal.actor()
    }

    pub fn has(&self, permission: &Permission) -> bool {
        is_privileged(&self.principal, permission)
    }
}
