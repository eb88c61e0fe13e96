//! Denial and failure taxonomy for dispatch attempts.
//!
//! Every variant carries the context an operator needs to decide whether to
//! retry, wait or escalate (limit numbers, kill-switch reason, forbidden mode).
//! Nothing in here is retried by the admission layer itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::execution_mode::{DispatchTarget, ExecutionMode};

/// Caller exceeded its request budget for the current window.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error(
    "rate limit exceeded for '{key}' ({count}/{limit} in {window_secs}s, retry after {retry_after_secs}s)"
)]
pub struct RateLimitedError {
    pub key: String,
    pub count: u32,
    pub limit: u32,
    pub window_secs: u64,
    pub retry_after_secs: u64,
}

/// The kill switch denies the requested tool.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("kill switch active: {reason}")]
pub struct KillSwitchActiveError {
    pub reason: String,
    pub activated_by: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub auto_resume_at: Option<DateTime<Utc>>,
}

/// The current operating mode forbids the dispatch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("dispatch target '{target}' is not permitted in execution mode '{current_mode}'")]
pub struct ExecutionModeError {
    pub target: DispatchTarget,
    pub current_mode: ExecutionMode,
}

/// The job type is at its concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("concurrency limit reached for '{job_type}' (current={current}, max={max})")]
pub struct ConcurrencyLimitError {
    pub job_type: String,
    pub current: u32,
    pub max: u32,
}

/// Which guard's backing state could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    RateLimiter,
    KillSwitch,
    ExecutionMode,
    Concurrency,
    AuditLog,
}

impl GuardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardKind::RateLimiter => "rate_limiter",
            GuardKind::KillSwitch => "kill_switch",
            GuardKind::ExecutionMode => "execution_mode",
            GuardKind::Concurrency => "concurrency",
            GuardKind::AuditLog => "audit_log",
        }
    }
}

impl core::fmt::Display for GuardKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a dispatch attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    #[error(transparent)]
    KillSwitchActive(#[from] KillSwitchActiveError),

    #[error(transparent)]
    ExecutionMode(#[from] ExecutionModeError),

    #[error(transparent)]
    ConcurrencyLimit(#[from] ConcurrencyLimitError),

    /// Downstream engine error, non-2xx response or timeout.
    #[error("workflow invocation failed: {cause}")]
    InvokeFailure { cause: String },

    /// Backing state for a guard is unreachable; the dispatch is denied.
    #[error("guard '{guard}' unavailable: {cause}")]
    GuardUnavailable { guard: GuardKind, cause: String },

    #[error("unknown tool id: {tool_id}")]
    UnknownTool { tool_id: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

impl DispatchError {
    pub fn invoke_failure(cause: impl Into<String>) -> Self {
        Self::InvokeFailure {
            cause: cause.into(),
        }
    }

    pub fn guard_unavailable(guard: GuardKind, cause: impl core::fmt::Display) -> Self {
        Self::GuardUnavailable {
            guard,
            cause: cause.to_string(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::RateLimited(_) => "RATE_LIMITED",
            DispatchError::KillSwitchActive(_) => "KILL_SWITCH_ACTIVE",
            DispatchError::ExecutionMode(_) => "EXECUTION_MODE_FORBIDDEN",
            DispatchError::ConcurrencyLimit(_) => "CONCURRENCY_LIMIT",
            DispatchError::InvokeFailure { .. } => "INVOKE_FAILURE",
            DispatchError::GuardUnavailable { .. } => "GUARD_UNAVAILABLE",
            DispatchError::UnknownTool { .. } => "UNKNOWN_TOOL_ID",
            DispatchError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// True for denials produced by an admission guard (ledger status `blocked`).
    pub fn is_guard_denial(&self) -> bool {
        matches!(
            self,
            DispatchError::RateLimited(_)
                | DispatchError::KillSwitchActive(_)
                | DispatchError::ExecutionMode(_)
                | DispatchError::ConcurrencyLimit(_)
                | DispatchError::GuardUnavailable { .. }
        )
    }

    /// Structured denial context (utilisation numbers, reason, mode).
    pub fn context(&self) -> serde_json::Value {
        match self {
            DispatchError::RateLimited(e) => json!({
                "key": e.key,
                "count": e.count,
                "limit": e.limit,
                "window_secs": e.window_secs,
                "retry_after_secs": e.retry_after_secs,
            }),
            DispatchError::KillSwitchActive(e) => json!({
                "reason": e.reason,
                "activated_by": e.activated_by,
                "activated_at": e.activated_at,
                "auto_resume_at": e.auto_resume_at,
            }),
            DispatchError::ExecutionMode(e) => json!({
                "target": e.target,
                "current_mode": e.current_mode,
            }),
            DispatchError::ConcurrencyLimit(e) => json!({
                "job_type": e.job_type,
                "current": e.current,
                "max": e.max,
            }),
            DispatchError::InvokeFailure { cause } => json!({ "cause": cause }),
            DispatchError::GuardUnavailable { guard, cause } => json!({
                "guard": guard,
                "cause": cause,
            }),
            DispatchError::UnknownTool { tool_id } => json!({ "tool_id": tool_id }),
            DispatchError::Validation(msg) => json!({ "message": msg }),
        }
    }

    /// Ledger metadata recorded when this error settles an attempt.
    pub fn audit_metadata(&self) -> serde_json::Value {
        json!({
            "reason": self.to_string(),
            "code": self.code(),
            "context": self.context(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_denial_reports_utilisation() {
        let err = DispatchError::from(ConcurrencyLimitError {
            job_type: "listing".to_string(),
            current: 2,
            max: 2,
        });

        assert_eq!(err.code(), "CONCURRENCY_LIMIT");
        assert!(err.to_string().contains("current=2, max=2"));
        assert_eq!(err.context()["current"], 2);
        assert_eq!(err.context()["max"], 2);
        assert!(err.is_guard_denial());
    }

    #[test]
    fn kill_switch_denial_carries_reason() {
        let err = DispatchError::from(KillSwitchActiveError {
            reason: "VERO spike detected".to_string(),
            activated_by: Some("ops".to_string()),
            activated_at: None,
            auto_resume_at: None,
        });

        let meta = err.audit_metadata();
        assert_eq!(meta["code"], "KILL_SWITCH_ACTIVE");
        assert_eq!(meta["context"]["reason"], "VERO spike detected");
    }

    #[test]
    fn invoke_failure_is_not_a_guard_denial() {
        let err = DispatchError::invoke_failure("timeout after 30s");
        assert!(!err.is_guard_denial());
        assert_eq!(err.context()["cause"], "timeout after 30s");
    }

    #[test]
    fn guard_unavailable_is_distinct_from_invoke_failure() {
        let err = DispatchError::guard_unavailable(GuardKind::Concurrency, "pool closed");
        assert_eq!(err.code(), "GUARD_UNAVAILABLE");
        assert_eq!(err.context()["guard"], "concurrency");
        assert!(err.is_guard_denial());
    }
}
