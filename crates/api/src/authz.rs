//! Permission checks at the route boundary.
//!
//! Read routes call [`require`]; control-plane mutations call [`privileged`],
//! which turns the auth decision into the [`Privileged`] token the guard
//! services demand before touching any store.

use dispatchgate_auth::{AuthzError, Permission, authorize};
use dispatchgate_guards::{PermissionDenied, Privileged};

use crate::context::PrincipalContext;

pub fn require(principal: &PrincipalContext, permission: &Permission) -> Result<(), AuthzError> {
    authorize(principal.principal(), permission)
}

pub fn privileged(
    principal: &PrincipalContext,
    permission: &Permission,
) -> Result<Privileged, PermissionDenied> {
    let allowed = principal.has(permission);
    if !allowed {
        tracing::warn!(
            actor = %principal.actor(),
            permission = %permission,
            "privileged action refused"
        );
    }
    Privileged::check(allowed, principal.actor(), permission.as_str())
}
