use thiserror::Error;

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Pure policy check: wildcard or exact permission match.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let granted = principal
        .permissions
        .iter()
        .any(|p| p.is_wildcard() || p == required);

    if granted {
        Ok(())
    } else {
        tracing::debug!(
            principal_id = %principal.principal_id,
            permission = %required,
            "authorization denied"
        );
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// The trusted boolean handed to privileged control-plane operations.
pub fn is_privileged(principal: &Principal, required: &Permission) -> bool {
    authorize(principal, required).is_ok()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{JwtClaims, PrincipalId, Role};

    fn principal(roles: Vec<Role>, permissions: Vec<Permission>) -> Principal {
        let now = Utc::now();
        Principal::from_claims(&JwtClaims {
            sub: PrincipalId::new(),
            name: None,
            roles,
            permissions,
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        })
    }

    #[test]
    fn admin_role_grants_everything() {
        let p = principal(vec![Role::ADMIN], vec![]);
        assert!(is_privileged(&p, &Permission::KILL_SWITCH_TOGGLE));
        assert!(is_privileged(&p, &Permission::CONCURRENCY_RESET));
    }

    #[test]
    fn operator_may_dispatch_but_not_toggle() {
        let p = principal(vec![Role::OPERATOR], vec![]);
        assert!(authorize(&p, &Permission::DISPATCH_EXECUTE).is_ok());
        assert_eq!(
            authorize(&p, &Permission::KILL_SWITCH_TOGGLE),
            Err(AuthzError::Forbidden("killswitch.toggle".to_string()))
        );
    }

    #[test]
    fn direct_grants_extend_the_role_mapping() {
        let p = principal(vec![Role::VIEWER], vec![Permission::CONCURRENCY_RESET]);
        assert!(is_privileged(&p, &Permission::CONCURRENCY_RESET));
        assert!(!is_privileged(&p, &Permission::DISPATCH_EXECUTE));
    }

    #[test]
    fn unknown_roles_grant_nothing() {
        let p = principal(vec![Role::new("intern")], vec![]);
        assert!(p.permissions.is_empty());
        assert!(!is_privileged(&p, &Permission::LOGS_READ));
    }
}
