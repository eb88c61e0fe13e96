use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value as JsonValue, json};

use dispatchgate_core::ExecutionLogId;
use dispatchgate_guards::{
    ExecutionLogEntry, LogFilter, LogKind, LogStats, LogStatus, NewExecutionLog, compute_stats,
};

use crate::clock::Clock;
use crate::store::{ExecutionLogStore, StoreError};

/// Append-only execution ledger.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn ExecutionLogStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl AuditLog {
    pub fn new(
        store: Arc<dyn ExecutionLogStore>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Write a `started` row.
    pub async fn start(&self, record: NewExecutionLog) -> Result<ExecutionLogId, StoreError> {
        let entry = ExecutionLogEntry::start(ExecutionLogId::new(), record, self.clock.now());
        self.store.insert_log(&entry).await?;
        tracing::debug!(log_id = %entry.id, tool_id = %entry.tool_id, kind = %entry.kind, "execution log started");
        Ok(entry.id)
    }

    /// Settle a row. A second completion for the same id is an error.
    pub async fn complete(
        &self,
        id: ExecutionLogId,
        status: LogStatus,
        metadata: JsonValue,
    ) -> Result<ExecutionLogEntry, StoreError> {
        match self.store.complete_log(id, status, metadata, self.clock.now()).await {
            Ok(entry) => Ok(entry),
            Err(err) => {
                tracing::error!(log_id = %id, status = %status, error = %err, "execution log completion failed");
                Err(err)
            }
        }
    }

    /// Record a privileged control action as a settled `admin` row.
    pub async fn record_admin(
        &self,
        action: &str,
        actor: &str,
        metadata: JsonValue,
    ) -> Result<ExecutionLogId, StoreError> {
        let id = self
            .start(
                NewExecutionLog::admin(action, Some(actor.to_string()))
                    .with_metadata(json!({ "action": action })),
            )
            .await?;
        self.complete(id, LogStatus::Completed, metadata).await?;
        Ok(id)
    }

    pub async fn get(&self, id: ExecutionLogId) -> Result<Option<ExecutionLogEntry>, StoreError> {
        self.store.get_log(id).await
    }

    pub async fn query(&self, filter: &LogFilter) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        self.store.query_logs(filter).await
    }

    /// Aggregate counts over the trailing `window`, reconciling stale
    /// `started` rows as failed. `stale_after` overrides the configured
    /// threshold for this call only.
    pub async fn stats(
        &self,
        window: Duration,
        kind: Option<LogKind>,
        stale_after: Option<Duration>,
    ) -> Result<LogStats, StoreError> {
        let now = self.clock.now();
        let window = window.min(LogStats::max_window());
        let window_start = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rows = self.store.logs_since(window_start, kind).await?;
        Ok(compute_stats(
            rows.iter(),
            window_start,
            now,
            stale_after.unwrap_or(self.stale_after),
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::FakeClock;
    use crate::store::InMemoryGuardStore;

    fn audit(clock: &FakeClock) -> AuditLog {
        AuditLog::new(
            Arc::new(InMemoryGuardStore::new()),
            Arc::new(clock.clone()),
            Duration::seconds(3600),
        )
    }

    #[tokio::test]
    async fn crashed_rows_surface_as_stuck_after_the_threshold() {
        let clock = FakeClock::new(Utc::now());
        let log = audit(&clock);

        let done = log
            .start(NewExecutionLog::dispatch("listing-local", None))
            .await
            .unwrap();
        log.complete(done, LogStatus::Completed, json!({})).await.unwrap();
        log.start(NewExecutionLog::dispatch("listing-local", None))
            .await
            .unwrap();

        let fresh = log.stats(Duration::hours(24), None, None).await.unwrap();
        assert_eq!(fresh.in_flight, 1);
        assert_eq!(fresh.stuck, 0);

        clock.advance(Duration::hours(2));
        let later = log.stats(Duration::hours(24), None, None).await.unwrap();
        assert_eq!(later.stuck, 1);
        assert_eq!(later.failed, 1);
        assert_eq!(later.completed, 1);

        // A per-call override can widen the threshold again.
        let lenient = log
            .stats(Duration::hours(24), None, Some(Duration::hours(3)))
            .await
            .unwrap();
        assert_eq!(lenient.stuck, 0);
    }

    #[tokio::test]
    async fn windows_beyond_a_year_are_clamped() {
        let clock = FakeClock::new(Utc::now());
        let log = audit(&clock);
        log.start(NewExecutionLog::dispatch("listing-local", None))
            .await
            .unwrap();

        let stats = log
            .stats(Duration::seconds(1_000_000_000_000_000), None, None)
            .await
            .unwrap();
        assert_eq!(stats.window_start, clock.now() - LogStats::max_window());
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn admin_rows_are_settled_immediately() {
        let clock = FakeClock::new(Utc::now());
        let log = audit(&clock);

        let id = log
            .record_admin("kill_switch.activate", "ops", json!({"reason": "maintenance"}))
            .await
            .unwrap();
        let row = log.get(id).await.unwrap().unwrap();

        assert_eq!(row.kind, LogKind::Admin);
        assert_eq!(row.status, LogStatus::Completed);
        assert_eq!(row.user_id.as_deref(), Some("ops"));
        assert_eq!(row.metadata["reason"], "maintenance");
        assert_eq!(row.metadata["action"], "kill_switch.activate");
    }

    #[tokio::test]
    async fn double_completion_is_loud() {
        let clock = FakeClock::new(Utc::now());
        let log = audit(&clock);
        let id = log
            .start(NewExecutionLog::dispatch("listing-local", None))
            .await
            .unwrap();
        log.complete(id, LogStatus::Failed, JsonValue::Null).await.unwrap();
        assert!(log.complete(id, LogStatus::Completed, JsonValue::Null).await.is_err());
    }
}
