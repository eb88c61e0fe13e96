//! `dispatchgate-auth` — bearer-token authentication and RBAC for the
//! dispatch control plane.
//!
//! Transport-agnostic: the API crate extracts the token, this crate verifies
//! it and answers "may this principal do X".

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, authorize, is_privileged};
pub use claims::{Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError, validate_claims};
pub use permissions::Permission;
pub use principal::{Principal, PrincipalId};
pub use roles::Role;
