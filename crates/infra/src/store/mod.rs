//! Persistence for guard state.
//!
//! Every mutation that a guard decision depends on is a single atomic
//! conditional operation in the backing store (a row lock in memory, a
//! conditional `UPDATE ... RETURNING` in Postgres). No guard relies on an
//! in-process mutex for correctness across instances.

pub mod in_memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use dispatchgate_core::{ExecutionLogId, ExpectedVersion, HolderId};
use dispatchgate_guards::{
    AcquireOutcome, ConcurrencyLimitError, ExecutionLogEntry, JobLockSnapshot, KillSwitchState,
    LedgerError, LogFilter, LogKind, LogStatus, RateDecision, RateLimitPolicy, ReleaseOutcome,
};

pub use in_memory::InMemoryGuardStore;
pub use postgres::PostgresGuardStore;

/// Storage failure.
///
/// Callers on the admission path treat every variant except `Ledger` and
/// `NotFound` as "guard state unreachable" and fail closed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution log not found: {0}")]
    NotFound(ExecutionLogId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("invalid stored data: {0}")]
    Corrupt(String),

    #[error("database error during {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            message: message.into(),
        }
    }
}

/// Store-level success with a domain-level admit/deny decision inside.
pub type AcquireResult = Result<AcquireOutcome, ConcurrencyLimitError>;

#[async_trait::async_trait]
pub trait JobLockStore: Send + Sync {
    /// Take a slot for `holder` if `active_count < max_limit`.
    ///
    /// The row is created on first use and adopts `max_limit` on every call.
    async fn try_acquire(
        &self,
        job_type: &str,
        holder: HolderId,
        max_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, StoreError>;

    /// Free `holder`'s slot. Releasing an unknown holder is a no-op.
    async fn release(
        &self,
        job_type: &str,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Zero one job type (or all when `None`). Returns the job types touched.
    async fn reset(
        &self,
        job_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// All known locks ordered by job type.
    async fn list_locks(&self) -> Result<Vec<JobLockSnapshot>, StoreError>;
}

#[async_trait::async_trait]
pub trait KillSwitchStore: Send + Sync {
    /// Stored row, or the inactive default if never written.
    async fn load_kill_switch(&self) -> Result<KillSwitchState, StoreError>;

    /// Replace the row if its version satisfies `expected`.
    ///
    /// Returns `false` when another writer got there first.
    async fn save_kill_switch(
        &self,
        next: &KillSwitchState,
        expected: ExpectedVersion,
    ) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn insert_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    /// `started → status`, exactly once.
    ///
    /// Fails with `Ledger(AlreadyTerminal)` on a second completion and
    /// `NotFound` for an unknown id.
    async fn complete_log(
        &self,
        id: ExecutionLogId,
        status: LogStatus,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<ExecutionLogEntry, StoreError>;

    async fn get_log(&self, id: ExecutionLogId) -> Result<Option<ExecutionLogEntry>, StoreError>;

    /// Newest first, at most `filter.limit` rows.
    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<ExecutionLogEntry>, StoreError>;

    /// Every row started at or after `since` (optionally one kind), for stats.
    async fn logs_since(
        &self,
        since: DateTime<Utc>,
        kind: Option<LogKind>,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError>;
}

#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key` in the current window.
    async fn hit(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError>;
}

/// Everything the admission layer persists.
pub trait GuardStore: JobLockStore + KillSwitchStore + ExecutionLogStore + RateLimitStore {}

impl<T> GuardStore for T where
    T: JobLockStore + KillSwitchStore + ExecutionLogStore + RateLimitStore + ?Sized
{
}
