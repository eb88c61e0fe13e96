//! Guard services: the store-backed halves of the admission checks.
//!
//! Each service pairs a pure model from `dispatchgate-guards` with a store
//! and a clock. Admission-path methods return [`DispatchError`] and fail
//! closed (`GuardUnavailable`) when their store cannot be reached;
//! control-plane methods return [`AdminError`] and require a
//! [`Privileged`](dispatchgate_guards::Privileged) token.

pub mod audit;
pub mod concurrency;
pub mod kill_switch;
pub mod rate_limiter;

use thiserror::Error;

use dispatchgate_core::DomainError;
use dispatchgate_guards::{DispatchError, GuardKind, PermissionDenied};

use crate::store::StoreError;

pub use audit::AuditLog;
pub use concurrency::{ConcurrencyGuard, ConcurrencyStatus};
pub use kill_switch::{ActivateKillSwitch, KillSwitch};
pub use rate_limiter::RateLimiter;

/// Control-plane failure.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Forbidden(#[from] PermissionDenied),

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("state changed concurrently: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fail closed: an unreachable store denies the dispatch.
pub(crate) fn unavailable(guard: GuardKind) -> impl FnOnce(StoreError) -> DispatchError {
    move |err| {
        tracing::error!(guard = %guard, error = %err, "guard store unavailable; denying dispatch");
        DispatchError::guard_unavailable(guard, err)
    }
}
