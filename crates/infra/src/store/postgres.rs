//! Postgres-backed guard store.
//!
//! ## Atomicity
//!
//! | operation | statement |
//! |-----------|-----------|
//! | acquire | `UPDATE job_locks ... WHERE active_count < max_limit RETURNING` |
//! | release | `UPDATE job_locks ... WHERE $holder = ANY(holders) RETURNING` |
//! | audit completion | `UPDATE execution_logs ... WHERE status = 'started' RETURNING` |
//! | kill-switch write | upsert guarded by `version = $expected` |
//! | rate limit | single upsert that restarts the count when the window moved |
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls`, SQLSTATE class `08`, `57P01` | `Unavailable` |
//! | Database `23505` (unique violation) | `Conflict` |
//! | anything else | `Backend` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use dispatchgate_core::{ExecutionLogId, ExpectedVersion, HolderId};
use dispatchgate_guards::{
    AcquireOutcome, ConcurrencyLimitError, ExecutionLogEntry, JobLockSnapshot, KillSwitchScope,
    KillSwitchState, LedgerError, LogFilter, LogKind, LogStatus, RateDecision, RateLimitPolicy,
    ReleaseOutcome,
};

use super::{
    AcquireResult, ExecutionLogStore, JobLockStore, KillSwitchStore, RateLimitStore, StoreError,
};

const SCHEMA: &str = include_str!("../../migrations/0001_dispatch_guards.sql");

#[derive(Debug, Clone)]
pub struct PostgresGuardStore {
    pool: Arc<PgPool>,
}

impl PostgresGuardStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables if missing (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobLockStore for PostgresGuardStore {
    #[instrument(skip_all, fields(job_type = %job_type, holder = %holder), err)]
    async fn try_acquire(
        &self,
        job_type: &str,
        holder: HolderId,
        max_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, StoreError> {
        // Ensure the row exists and carries the configured ceiling.
        sqlx::query(
            r#"
            INSERT INTO job_locks (job_type, active_count, max_limit, holders, updated_at)
            VALUES ($1, 0, $2, '{}', $3)
            ON CONFLICT (job_type) DO UPDATE
            SET max_limit = GREATEST(job_locks.active_count, EXCLUDED.max_limit)
            "#,
        )
        .bind(job_type)
        .bind(max_limit as i32)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_job_lock", e))?;

        let admitted = sqlx::query(
            r#"
            UPDATE job_locks
            SET active_count = active_count + 1,
                holders = array_append(holders, $2),
                updated_at = $3
            WHERE job_type = $1
              AND active_count < max_limit
              AND NOT ($2 = ANY(holders))
            RETURNING active_count, max_limit
            "#,
        )
        .bind(job_type)
        .bind(holder.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_job_lock", e))?;

        if let Some(row) = admitted {
            let active_count: i32 = row.try_get("active_count").map_err(corrupt)?;
            let max_limit: i32 = row.try_get("max_limit").map_err(corrupt)?;
            return Ok(Ok(AcquireOutcome::Acquired {
                active_count: active_count as u32,
                max_limit: max_limit as u32,
            }));
        }

        // Not admitted: report why (already held, or at the ceiling).
        let row = sqlx::query(
            r#"
            SELECT active_count, max_limit, ($2 = ANY(holders)) AS held
            FROM job_locks
            WHERE job_type = $1
            "#,
        )
        .bind(job_type)
        .bind(holder.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_job_lock", e))?;

        let active_count: i32 = row.try_get("active_count").map_err(corrupt)?;
        let max_limit: i32 = row.try_get("max_limit").map_err(corrupt)?;
        let held: bool = row.try_get("held").map_err(corrupt)?;

        if held {
            Ok(Ok(AcquireOutcome::AlreadyHeld {
                active_count: active_count as u32,
                max_limit: max_limit as u32,
            }))
        } else {
            Ok(Err(ConcurrencyLimitError {
                job_type: job_type.to_string(),
                current: active_count as u32,
                max: max_limit as u32,
            }))
        }
    }

    #[instrument(skip_all, fields(job_type = %job_type, holder = %holder), err)]
    async fn release(
        &self,
        job_type: &str,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let released = sqlx::query(
            r#"
            UPDATE job_locks
            SET active_count = active_count - 1,
                holders = array_remove(holders, $2),
                updated_at = $3
            WHERE job_type = $1 AND $2 = ANY(holders)
            RETURNING active_count
            "#,
        )
        .bind(job_type)
        .bind(holder.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_job_lock", e))?;

        if let Some(row) = released {
            let active_count: i32 = row.try_get("active_count").map_err(corrupt)?;
            return Ok(ReleaseOutcome::Released {
                active_count: active_count as u32,
            });
        }

        let current: Option<i32> =
            sqlx::query_scalar("SELECT active_count FROM job_locks WHERE job_type = $1")
                .bind(job_type)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("read_job_lock", e))?;
        Ok(ReleaseOutcome::NotHeld {
            active_count: current.unwrap_or(0) as u32,
        })
    }

    #[instrument(skip(self), err)]
    async fn reset(
        &self,
        job_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE job_locks
            SET active_count = 0, holders = '{}', updated_at = $2
            WHERE ($1::text IS NULL OR job_type = $1)
            RETURNING job_type
            "#,
        )
        .bind(job_type)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_job_locks", e))?;

        let mut touched = rows
            .iter()
            .map(|row| row.try_get::<String, _>("job_type"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(corrupt)?;
        touched.sort();
        Ok(touched)
    }

    async fn list_locks(&self) -> Result<Vec<JobLockSnapshot>, StoreError> {
        let rows = sqlx::query_as::<_, JobLockRow>(
            r#"
            SELECT job_type, active_count, max_limit, holders, updated_at
            FROM job_locks
            ORDER BY job_type ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_job_locks", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait::async_trait]
impl KillSwitchStore for PostgresGuardStore {
    async fn load_kill_switch(&self) -> Result<KillSwitchState, StoreError> {
        let row = sqlx::query_as::<_, KillSwitchRow>(
            r#"
            SELECT active, reason, activated_at, activated_by, auto_resume_at,
                   paused_tools, version, updated_at
            FROM kill_switch
            WHERE id = 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_kill_switch", e))?;

        Ok(row.map(Into::into).unwrap_or_else(KillSwitchState::inactive))
    }

    #[instrument(skip_all, fields(active = next.active, version = next.version), err)]
    async fn save_kill_switch(
        &self,
        next: &KillSwitchState,
        expected: ExpectedVersion,
    ) -> Result<bool, StoreError> {
        let expected_version: Option<i64> = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let paused_tools: Option<Vec<String>> = next
            .scope
            .paused_tools()
            .map(|tools| tools.iter().cloned().collect());

        let result = sqlx::query(
            r#"
            INSERT INTO kill_switch (
                id, active, reason, activated_at, activated_by, auto_resume_at,
                paused_tools, version, updated_at
            )
            VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET active = EXCLUDED.active,
                reason = EXCLUDED.reason,
                activated_at = EXCLUDED.activated_at,
                activated_by = EXCLUDED.activated_by,
                auto_resume_at = EXCLUDED.auto_resume_at,
                paused_tools = EXCLUDED.paused_tools,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at
            WHERE ($9::bigint IS NULL OR kill_switch.version = $9)
            "#,
        )
        .bind(next.active)
        .bind(next.reason.as_deref())
        .bind(next.activated_at)
        .bind(next.activated_by.as_deref())
        .bind(next.auto_resume_at)
        .bind(paused_tools)
        .bind(next.version as i64)
        .bind(next.updated_at)
        .bind(expected_version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_kill_switch", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl ExecutionLogStore for PostgresGuardStore {
    #[instrument(skip_all, fields(log_id = %entry.id, tool_id = %entry.tool_id), err)]
    async fn insert_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (
                id, type, tool_id, user_id, status, started_at, completed_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.kind.as_str())
        .bind(&entry.tool_id)
        .bind(entry.user_id.as_deref())
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(&entry.metadata)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_execution_log", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(log_id = %id, status = %status), err)]
    async fn complete_log(
        &self,
        id: ExecutionLogId,
        status: LogStatus,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<ExecutionLogEntry, StoreError> {
        if !status.is_terminal() {
            return Err(LedgerError::NotTerminal(status).into());
        }

        let completed = sqlx::query_as::<_, ExecutionLogRow>(
            r#"
            UPDATE execution_logs
            SET status = $2, completed_at = $3, metadata = metadata || $4
            WHERE id = $1 AND status = 'started'
            RETURNING id, type, tool_id, user_id, status, started_at, completed_at, metadata
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(now)
        .bind(completion_patch(metadata))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_execution_log", e))?;

        if let Some(row) = completed {
            return row.try_into();
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT status FROM execution_logs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("read_execution_log", e))?;

        match existing {
            None => Err(StoreError::NotFound(id)),
            Some(raw) => {
                let status = LogStatus::parse(&raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown log status '{raw}'")))?;
                Err(LedgerError::AlreadyTerminal { id, status }.into())
            }
        }
    }

    async fn get_log(&self, id: ExecutionLogId) -> Result<Option<ExecutionLogEntry>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionLogRow>(
            r#"
            SELECT id, type, tool_id, user_id, status, started_at, completed_at, metadata
            FROM execution_logs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_execution_log", e))?;

        row.map(ExecutionLogEntry::try_from).transpose()
    }

    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(
            r#"
            SELECT id, type, tool_id, user_id, status, started_at, completed_at, metadata
            FROM execution_logs
            WHERE ($1::text IS NULL OR type = $1)
              AND ($2::text IS NULL OR tool_id = $2)
              AND ($3::text IS NULL OR user_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR started_at >= $5)
              AND ($6::timestamptz IS NULL OR started_at < $6)
            ORDER BY started_at DESC, id DESC
            LIMIT $7
            "#,
        )
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.tool_id.as_deref())
        .bind(filter.user_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.started_after)
        .bind(filter.started_before)
        .bind(filter.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_execution_logs", e))?;

        rows.into_iter().map(ExecutionLogEntry::try_from).collect()
    }

    async fn logs_since(
        &self,
        since: DateTime<Utc>,
        kind: Option<LogKind>,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionLogRow>(
            r#"
            SELECT id, type, tool_id, user_id, status, started_at, completed_at, metadata
            FROM execution_logs
            WHERE started_at >= $1 AND ($2::text IS NULL OR type = $2)
            ORDER BY started_at DESC, id DESC
            "#,
        )
        .bind(since)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("execution_logs_since", e))?;

        rows.into_iter().map(ExecutionLogEntry::try_from).collect()
    }
}

#[async_trait::async_trait]
impl RateLimitStore for PostgresGuardStore {
    async fn hit(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError> {
        let window_start = policy.window_start(now);
        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limit_buckets (key, window_start, count, "limit")
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (key) DO UPDATE
            SET count = CASE
                    WHEN rate_limit_buckets.window_start = EXCLUDED.window_start
                    THEN rate_limit_buckets.count + 1
                    ELSE 1
                END,
                window_start = EXCLUDED.window_start,
                "limit" = EXCLUDED."limit"
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .bind(policy.limit as i32)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("rate_limit_hit", e))?;

        Ok(RateDecision::from_count(
            key,
            count.max(0) as u32,
            policy,
            window_start,
            now,
        ))
    }
}

/// Completion metadata as a JSON object suitable for `jsonb ||`.
fn completion_patch(metadata: JsonValue) -> JsonValue {
    match metadata {
        JsonValue::Object(_) => metadata,
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => serde_json::json!({ "completion": other }),
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(format!("{operation}: {message}")),
                Some(code) if code.starts_with("08") || code == "57P01" => {
                    StoreError::unavailable(operation, message)
                }
                _ => StoreError::Backend { operation, message },
            }
        }
        sqlx::Error::PoolClosed => StoreError::unavailable(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(operation, "timed out waiting for a connection")
        }
        sqlx::Error::Io(e) => StoreError::unavailable(operation, e.to_string()),
        sqlx::Error::Tls(e) => StoreError::unavailable(operation, e.to_string()),
        other => StoreError::Backend {
            operation,
            message: other.to_string(),
        },
    }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

// SQLx row types

#[derive(Debug)]
struct JobLockRow {
    job_type: String,
    active_count: i32,
    max_limit: i32,
    holders: Vec<Uuid>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobLockRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobLockRow {
            job_type: row.try_get("job_type")?,
            active_count: row.try_get("active_count")?,
            max_limit: row.try_get("max_limit")?,
            holders: row.try_get("holders")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<JobLockRow> for JobLockSnapshot {
    fn from(row: JobLockRow) -> Self {
        let active_count = row.active_count.max(0) as u32;
        let max_limit = row.max_limit.max(0) as u32;
        JobLockSnapshot {
            job_type: row.job_type,
            active_count,
            max_limit,
            available: max_limit.saturating_sub(active_count),
            holders: row.holders.into_iter().map(HolderId::from_uuid).collect(),
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct KillSwitchRow {
    active: bool,
    reason: Option<String>,
    activated_at: Option<DateTime<Utc>>,
    activated_by: Option<String>,
    auto_resume_at: Option<DateTime<Utc>>,
    paused_tools: Option<Vec<String>>,
    version: i64,
    updated_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for KillSwitchRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(KillSwitchRow {
            active: row.try_get("active")?,
            reason: row.try_get("reason")?,
            activated_at: row.try_get("activated_at")?,
            activated_by: row.try_get("activated_by")?,
            auto_resume_at: row.try_get("auto_resume_at")?,
            paused_tools: row.try_get("paused_tools")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<KillSwitchRow> for KillSwitchState {
    fn from(row: KillSwitchRow) -> Self {
        KillSwitchState {
            active: row.active,
            reason: row.reason,
            activated_at: row.activated_at,
            activated_by: row.activated_by,
            auto_resume_at: row.auto_resume_at,
            scope: match row.paused_tools {
                None => KillSwitchScope::All,
                Some(tools) => KillSwitchScope::tools(tools),
            },
            version: row.version.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug)]
struct ExecutionLogRow {
    id: Uuid,
    kind: String,
    tool_id: String,
    user_id: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    metadata: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ExecutionLogRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutionLogRow {
            id: row.try_get("id")?,
            kind: row.try_get("type")?,
            tool_id: row.try_get("tool_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<ExecutionLogRow> for ExecutionLogEntry {
    type Error = StoreError;

    fn try_from(row: ExecutionLogRow) -> Result<Self, Self::Error> {
        let kind = LogKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log type '{}'", row.kind)))?;
        let status = LogStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log status '{}'", row.status)))?;
        Ok(ExecutionLogEntry {
            id: ExecutionLogId::from_uuid(row.id),
            kind,
            tool_id: row.tool_id,
            user_id: row.user_id,
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            metadata: row.metadata,
        })
    }
}
