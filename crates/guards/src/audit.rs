//! Execution ledger model.
//!
//! Rows are append-only: a row is written `started` and may transition exactly
//! once to a terminal status. Rows left `started` by a crash are never mutated;
//! [`compute_stats`] reconciles them at read time by treating `started` rows
//! older than the staleness threshold as implicitly failed ("stuck").

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use dispatchgate_core::ExecutionLogId;

/// Ledger row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// A dispatch attempt through the admission layer.
    Dispatch,
    /// A privileged control action (kill switch, concurrency reset).
    Admin,
}

/// Ledger row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
    Blocked,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Dispatch => "dispatch",
            LogKind::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch" => Some(LogKind::Dispatch),
            "admin" => Some(LogKind::Admin),
            _ => None,
        }
    }
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
            LogStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(LogStatus::Started),
            "completed" => Some(LogStatus::Completed),
            "failed" => Some(LogStatus::Failed),
            "blocked" => Some(LogStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatus::Started)
    }
}

impl core::fmt::Display for LogKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger transition errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("execution log {id} is already terminal ({status})")]
    AlreadyTerminal { id: ExecutionLogId, status: LogStatus },

    #[error("cannot complete execution log with non-terminal status '{0}'")]
    NotTerminal(LogStatus),
}

/// Data supplied when an attempt starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecutionLog {
    pub kind: LogKind,
    pub tool_id: String,
    pub user_id: Option<String>,
    pub metadata: JsonValue,
}

impl NewExecutionLog {
    pub fn dispatch(tool_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            kind: LogKind::Dispatch,
            tool_id: tool_id.into(),
            user_id,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn admin(action: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            kind: LogKind::Admin,
            tool_id: action.into(),
            user_id,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: ExecutionLogId,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub tool_id: String,
    pub user_id: Option<String>,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
}

impl ExecutionLogEntry {
    pub fn start(id: ExecutionLogId, new: NewExecutionLog, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            tool_id: new.tool_id,
            user_id: new.user_id,
            status: LogStatus::Started,
            started_at: now,
            completed_at: None,
            metadata: new.metadata,
        }
    }

    /// The single allowed `started → terminal` transition.
    pub fn complete(
        &mut self,
        status: LogStatus,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NotTerminal(status));
        }
        if self.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }

        self.status = status;
        self.completed_at = Some(now);
        merge_metadata(&mut self.metadata, metadata);
        Ok(())
    }

    /// `started` for at least `stale_after`: presumed lost to a crash.
    pub fn is_stuck(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == LogStatus::Started && now - self.started_at >= stale_after
    }

    /// Status used for reporting (stuck rows count as failed).
    pub fn effective_status(&self, now: DateTime<Utc>, stale_after: Duration) -> LogStatus {
        if self.is_stuck(now, stale_after) {
            LogStatus::Failed
        } else {
            self.status
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds().max(0))
    }
}

/// Shallow-merge completion metadata into the start metadata.
pub fn merge_metadata(base: &mut JsonValue, extra: JsonValue) {
    match extra {
        JsonValue::Null => {}
        JsonValue::Object(extra) => match base {
            JsonValue::Object(base) => base.extend(extra),
            other => *other = JsonValue::Object(extra),
        },
        other => match base {
            JsonValue::Object(base) => {
                base.insert("completion".to_string(), other);
            }
            slot => *slot = other,
        },
    }
}

/// Query filter (all fields optional, AND-combined).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub kind: Option<LogKind>,
    pub tool_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<LogStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            kind: None,
            tool_id: None,
            user_id: None,
            status: None,
            started_after: None,
            started_before: None,
            limit: 100,
        }
    }
}

impl LogFilter {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn with_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit.unwrap_or(100).clamp(1, Self::MAX_LIMIT);
        self
    }

    pub fn matches(&self, entry: &ExecutionLogEntry) -> bool {
        self.kind.is_none_or(|k| entry.kind == k)
            && self.tool_id.as_deref().is_none_or(|t| entry.tool_id == t)
            && self
                .user_id
                .as_deref()
                .is_none_or(|u| entry.user_id.as_deref() == Some(u))
            && self.status.is_none_or(|s| entry.status == s)
            && self.started_after.is_none_or(|t| entry.started_at >= t)
            && self.started_before.is_none_or(|t| entry.started_at < t)
    }
}

/// Per-tool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    pub in_flight: u64,
    pub stuck: u64,
}

impl ToolStats {
    fn record(&mut self, entry: &ExecutionLogEntry, now: DateTime<Utc>, stale_after: Duration) {
        self.total += 1;
        match entry.status {
            LogStatus::Completed => self.completed += 1,
            LogStatus::Failed => self.failed += 1,
            LogStatus::Blocked => self.blocked += 1,
            LogStatus::Started if entry.is_stuck(now, stale_after) => {
                self.stuck += 1;
                self.failed += 1;
            }
            LogStatus::Started => self.in_flight += 1,
        }
    }
}

/// Aggregate ledger statistics over a window.
///
/// `failed` already includes `stuck` rows; `stuck` is reported separately for
/// health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub window_start: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub stale_after_secs: i64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    pub in_flight: u64,
    pub stuck: u64,
    /// `completed / (completed + failed)`; `None` when nothing settled.
    pub success_rate: Option<f64>,
    pub by_tool: BTreeMap<String, ToolStats>,
}

impl LogStats {
    /// Longest stats window and staleness threshold accepted (365 days).
    pub const MAX_WINDOW_SECS: i64 = 365 * 24 * 3600;

    pub fn max_window() -> Duration {
        Duration::seconds(Self::MAX_WINDOW_SECS)
    }
}

/// Reconcile and aggregate the rows that started inside `[window_start, now]`.
pub fn compute_stats<'a, I>(
    entries: I,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> LogStats
where
    I: IntoIterator<Item = &'a ExecutionLogEntry>,
{
    let mut totals = ToolStats::default();
    let mut by_tool: BTreeMap<String, ToolStats> = BTreeMap::new();

    for entry in entries {
        if entry.started_at < window_start || entry.started_at > now {
            continue;
        }
        totals.record(entry, now, stale_after);
        by_tool
            .entry(entry.tool_id.clone())
            .or_default()
            .record(entry, now, stale_after);
    }

    let settled = totals.completed + totals.failed;
    let success_rate = (settled > 0).then(|| totals.completed as f64 / settled as f64);

    LogStats {
        window_start,
        generated_at: now,
        stale_after_secs: stale_after.num_seconds(),
        total: totals.total,
        completed: totals.completed,
        failed: totals.failed,
        blocked: totals.blocked,
        in_flight: totals.in_flight,
        stuck: totals.stuck,
        success_rate,
        by_tool,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    fn started(tool: &str, secs: i64) -> ExecutionLogEntry {
        ExecutionLogEntry::start(
            ExecutionLogId::new(),
            NewExecutionLog::dispatch(tool, Some("u1".to_string())),
            at(secs),
        )
    }

    #[test]
    fn completion_is_a_single_transition() {
        let mut e = started("listing-local", 0);
        e.complete(LogStatus::Completed, json!({"result": "ok"}), at(5))
            .unwrap();

        assert_eq!(e.status, LogStatus::Completed);
        assert_eq!(e.completed_at, Some(at(5)));
        assert_eq!(e.duration_ms(), Some(5000));

        let err = e.complete(LogStatus::Failed, JsonValue::Null, at(6)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::AlreadyTerminal { status: LogStatus::Completed, .. }
        ));
        assert_eq!(e.status, LogStatus::Completed);
    }

    #[test]
    fn completing_with_started_is_rejected() {
        let mut e = started("listing-local", 0);
        assert_eq!(
            e.complete(LogStatus::Started, JsonValue::Null, at(1)),
            Err(LedgerError::NotTerminal(LogStatus::Started))
        );
    }

    #[test]
    fn completion_metadata_is_merged() {
        let mut e = started("listing-local", 0);
        e.metadata = json!({"action": "run", "job_type": "listing"});
        e.complete(LogStatus::Blocked, json!({"reason": "kill switch"}), at(0))
            .unwrap();

        assert_eq!(e.metadata["action"], "run");
        assert_eq!(e.metadata["reason"], "kill switch");
    }

    #[test]
    fn stale_started_rows_count_as_stuck_and_failed() {
        let stale = Duration::seconds(600);
        let mut ok = started("listing-local", 0);
        ok.complete(LogStatus::Completed, JsonValue::Null, at(10)).unwrap();
        let mut blocked = started("listing-local", 0);
        blocked
            .complete(LogStatus::Blocked, JsonValue::Null, at(0))
            .unwrap();
        let crashed = started("stock-killer", 0);
        let running = started("stock-killer", 900);

        let stats = compute_stats([&ok, &blocked, &crashed, &running], at(0), at(1000), stale);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.stuck, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.success_rate, Some(0.5));
        assert_eq!(stats.by_tool["stock-killer"].stuck, 1);
        assert_eq!(stats.by_tool["stock-killer"].in_flight, 1);

        // Reconciliation never touches the stored row.
        assert_eq!(crashed.status, LogStatus::Started);
        assert_eq!(crashed.effective_status(at(1000), stale), LogStatus::Failed);
    }

    #[test]
    fn stats_ignore_rows_outside_the_window() {
        let old = started("listing-local", -100);
        let stats = compute_stats([&old], at(0), at(10), Duration::seconds(60));
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, None);
    }

    #[test]
    fn filter_combines_fields() {
        let mut e = started("listing-local", 10);
        e.complete(LogStatus::Failed, JsonValue::Null, at(11)).unwrap();

        let f = LogFilter {
            tool_id: Some("listing-local".to_string()),
            status: Some(LogStatus::Failed),
            started_after: Some(at(0)),
            ..LogFilter::default()
        };
        assert!(f.matches(&e));

        let f = LogFilter {
            status: Some(LogStatus::Completed),
            ..LogFilter::default()
        };
        assert!(!f.matches(&e));

        let f = LogFilter {
            kind: Some(LogKind::Admin),
            ..LogFilter::default()
        };
        assert!(!f.matches(&e));
    }

    #[test]
    fn limit_is_capped() {
        assert_eq!(LogFilter::default().with_limit(Some(5000)).limit, 1000);
        assert_eq!(LogFilter::default().with_limit(Some(0)).limit, 1);
        assert_eq!(LogFilter::default().with_limit(None).limit, 100);
    }
}
