//! Dispatch admission guards (pure).
//!
//! This crate holds the decision logic of the admission layer as deterministic
//! functions over explicit state and an explicit `now`: kill-switch
//! evaluation, execution-mode policy, job-lock counters, ledger
//! reconciliation and rate-limit windows. No IO, no HTTP, no storage; the
//! infra crate persists these models and applies them atomically.

pub mod audit;
pub mod concurrency;
pub mod error;
pub mod execution_mode;
pub mod kill_switch;
pub mod privilege;
pub mod rate_limit;
pub mod tool;

pub use audit::{
    ExecutionLogEntry, LedgerError, LogFilter, LogKind, LogStats, LogStatus, NewExecutionLog,
    ToolStats, compute_stats,
};
pub use concurrency::{
    AcquireOutcome, ConcurrencyLimits, JobLock, JobLockSnapshot, ReleaseOutcome,
};
pub use error::{
    ConcurrencyLimitError, DispatchError, ExecutionModeError, GuardKind, KillSwitchActiveError,
    RateLimitedError,
};
pub use execution_mode::{DispatchTarget, ExecutionMode, ExecutionModeInfo};
pub use kill_switch::{KillSwitchEvaluation, KillSwitchScope, KillSwitchState};
pub use privilege::{PermissionDenied, Privileged};
pub use rate_limit::{RateDecision, RateLimitBucket, RateLimitPolicy};
pub use tool::{ToolCatalogue, ToolDefinition, ToolExecution, fingerprint, job_type_for};
