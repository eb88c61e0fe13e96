//! The dispatch state machine.
//!
//! `rate limit -> kill switch -> execution mode -> acquire -> audit start ->
//! invoke -> release -> audit complete`. A denial at any guard short-circuits
//! before the engine is called but still writes one `blocked` ledger row.
//! Once a slot is acquired, invocation and settlement run on their own task,
//! so the slot is released and the row completed even if the caller goes
//! away or the engine future panics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::Instrument;

use dispatchgate_core::{ExecutionLogId, HolderId};
use dispatchgate_guards::{
    AcquireOutcome, DispatchError, DispatchTarget, ExecutionMode, GuardKind, LogStatus,
    NewExecutionLog, RateDecision, ToolCatalogue, ToolExecution, fingerprint,
    job_type_for,
};

use crate::admission::{AuditLog, ConcurrencyGuard, KillSwitch, RateLimiter};
use crate::engine::{EngineError, InvokeRequest, WorkflowEngine};
use crate::store::StoreError;

fn default_action() -> String {
    "run".to_string()
}

/// Inbound dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(alias = "toolId")]
    pub tool_id: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub params: JsonValue,
}

impl DispatchRequest {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            action: default_action(),
            params: JsonValue::Null,
        }
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Completed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyInfo {
    pub job_type: String,
    pub active: u32,
    pub max: u32,
}

/// Guard counters observed while admitting the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardInfo {
    pub execution_mode: ExecutionMode,
    pub rate_limit: RateLimitInfo,
    pub concurrency: ConcurrencyInfo,
}

/// Result of an admitted dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub log_id: ExecutionLogId,
    pub tool_id: String,
    pub job_type: String,
    pub status: DispatchState,
    pub fingerprint: String,
    pub webhook_path: String,
    /// Engine output; absent for background dispatches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    pub guard_info: GuardInfo,
}

/// `GET /dispatch` view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub enabled: bool,
    pub kill_switch_active: bool,
    pub registered_tools: usize,
    pub execution_mode: ExecutionMode,
}

/// Attempt context threaded through the pipeline.
struct Attempt {
    tool_id: String,
    job_type: String,
    action: String,
    params: JsonValue,
    user_id: Option<String>,
    fingerprint: String,
}

impl Attempt {
    fn log_record(&self) -> NewExecutionLog {
        NewExecutionLog::dispatch(&self.tool_id, self.user_id.clone()).with_metadata(json!({
            "job_type": self.job_type,
            "action": self.action,
            "fingerprint": self.fingerprint,
        }))
    }
}

/// A request that holds a concurrency slot and a `started` row.
struct Admitted {
    log_id: ExecutionLogId,
    holder: HolderId,
    invoke: InvokeRequest,
    job_type: String,
}

#[derive(Clone)]
pub struct DispatchCoordinator {
    catalogue: Arc<ToolCatalogue>,
    rate_limiter: RateLimiter,
    kill_switch: KillSwitch,
    concurrency: ConcurrencyGuard,
    audit: AuditLog,
    engine: Arc<dyn WorkflowEngine>,
    execution_mode: ExecutionMode,
    invoke_timeout: Duration,
}

impl DispatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalogue: Arc<ToolCatalogue>,
        rate_limiter: RateLimiter,
        kill_switch: KillSwitch,
        concurrency: ConcurrencyGuard,
        audit: AuditLog,
        engine: Arc<dyn WorkflowEngine>,
        execution_mode: ExecutionMode,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            catalogue,
            rate_limiter,
            kill_switch,
            concurrency,
            audit,
            engine,
            execution_mode,
            invoke_timeout,
        }
    }

    pub fn catalogue(&self) -> &ToolCatalogue {
        &self.catalogue
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub async fn summary(&self) -> Result<DispatchSummary, StoreError> {
        let kill_switch = self.kill_switch.status().await?;
        Ok(DispatchSummary {
            enabled: !kill_switch.active
                && self.execution_mode.allows(DispatchTarget::WorkflowEngine),
            kill_switch_active: kill_switch.active,
            registered_tools: self.catalogue.len(),
            execution_mode: self.execution_mode,
        })
    }

    /// Admit and run one tool invocation on behalf of `user_id`.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        user_id: Option<String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let tool_id = self.catalogue.normalize_tool_id(&request.tool_id);
        // Always derived; callers cannot pick the bucket they are counted in.
        let job_type = job_type_for(&tool_id);
        let attempt = Attempt {
            fingerprint: fingerprint(&tool_id, &request.action, &request.params),
            tool_id,
            job_type,
            action: request.action,
            params: request.params,
            user_id,
        };

        let span = tracing::info_span!(
            "dispatch",
            tool_id = %attempt.tool_id,
            job_type = %attempt.job_type,
            user_id = ?attempt.user_id,
        );
        self.run(attempt).instrument(span).await
    }

    async fn run(&self, attempt: Attempt) -> Result<DispatchOutcome, DispatchError> {
        if let Err(err) = validate(&attempt) {
            return Err(self.reject(&attempt, LogStatus::Failed, err).await);
        }

        let rate = match self.admit(&attempt).await {
            Ok(rate) => rate,
            Err(err) => return Err(self.reject(&attempt, LogStatus::Blocked, err).await),
        };

        let tool = match self.catalogue.resolve(&attempt.tool_id) {
            Ok(tool) => tool.clone(),
            Err(err) => return Err(self.reject(&attempt, LogStatus::Failed, err).await),
        };

        let holder = HolderId::new();
        let slot = match self.concurrency.acquire(&attempt.job_type, holder).await {
            Ok(slot) => slot,
            Err(err) => return Err(self.reject(&attempt, LogStatus::Blocked, err).await),
        };

        let log_id = match self.audit.start(attempt.log_record()).await {
            Ok(id) => id,
            Err(err) => {
                self.release(&attempt.job_type, holder).await;
                return Err(DispatchError::guard_unavailable(GuardKind::AuditLog, err));
            }
        };

        let guard_info = self.guard_info(&attempt.job_type, &rate, &slot);
        let admitted = Admitted {
            log_id,
            holder,
            job_type: attempt.job_type.clone(),
            invoke: InvokeRequest {
                log_id,
                tool_id: tool.tool_id.clone(),
                webhook_path: tool.webhook_path.clone(),
                action: attempt.action,
                params: attempt.params,
            },
        };
        tracing::info!(log_id = %log_id, execution = ?tool.execution, "dispatch admitted");

        let mut outcome = DispatchOutcome {
            log_id,
            tool_id: tool.tool_id.clone(),
            job_type: attempt.job_type,
            status: DispatchState::Pending,
            fingerprint: attempt.fingerprint,
            webhook_path: tool.webhook_path.clone(),
            result: None,
            guard_info,
        };

        let this = self.clone();
        let task = tokio::spawn(
            async move { this.invoke_and_settle(admitted).await }.in_current_span(),
        );

        if tool.execution == ToolExecution::Background {
            return Ok(outcome);
        }

        let result = task.await.map_err(|e| {
            DispatchError::invoke_failure(format!("dispatch task aborted: {e}"))
        })??;
        outcome.status = DispatchState::Completed;
        outcome.result = Some(result);
        Ok(outcome)
    }

    /// Rate limit, kill switch, then execution mode.
    async fn admit(&self, attempt: &Attempt) -> Result<RateDecision, DispatchError> {
        let rate_key = format!("user:{}", attempt.user_id.as_deref().unwrap_or("anonymous"));
        let rate = self.rate_limiter.check(&rate_key).await?;
        self.kill_switch.check(&attempt.tool_id).await?;
        self.execution_mode.check(DispatchTarget::WorkflowEngine)?;
        Ok(rate)
    }

    /// Call the engine under the timeout, then release and complete exactly once.
    async fn invoke_and_settle(&self, admitted: Admitted) -> Result<JsonValue, DispatchError> {
        let engine = self.engine.clone();
        let request = admitted.invoke.clone();
        let timeout = self.invoke_timeout;
        let call = tokio::spawn(async move {
            tokio::time::timeout(timeout, engine.invoke(&request)).await
        });

        let result = match call.await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(invoke_failure(err)),
            Ok(Err(_elapsed)) => Err(DispatchError::invoke_failure(format!(
                "workflow engine timed out after {}s",
                timeout.as_secs()
            ))),
            Err(join) => Err(DispatchError::invoke_failure(format!(
                "workflow invocation panicked: {join}"
            ))),
        };

        self.release(&admitted.job_type, admitted.holder).await;

        let (status, metadata) = match &result {
            Ok(value) => (LogStatus::Completed, json!({ "result": summarize(value) })),
            Err(err) => {
                tracing::warn!(log_id = %admitted.log_id, error = %err, "workflow invocation failed");
                (LogStatus::Failed, err.audit_metadata())
            }
        };
        // Completion errors are already logged by the ledger.
        let _ = self.audit.complete(admitted.log_id, status, metadata).await;
        result
    }

    async fn release(&self, job_type: &str, holder: HolderId) {
        if let Err(err) = self.concurrency.release(job_type, holder).await {
            tracing::error!(job_type, holder = %holder, error = %err, "failed to release concurrency slot");
        }
    }

    /// Record a rejected attempt and hand the error back.
    async fn reject(&self, attempt: &Attempt, status: LogStatus, err: DispatchError) -> DispatchError {
        tracing::info!(code = err.code(), error = %err, "dispatch denied");

        let mut metadata = err.audit_metadata();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("job_type".to_string(), json!(attempt.job_type));
            map.insert("fingerprint".to_string(), json!(attempt.fingerprint));
        }
        match self.audit.start(attempt.log_record()).await {
            Ok(id) => {
                let _ = self.audit.complete(id, status, metadata).await;
            }
            Err(audit_err) => {
                tracing::error!(error = %audit_err, "failed to audit denied dispatch");
            }
        }
        err
    }

    fn guard_info(&self, job_type: &str, rate: &RateDecision, slot: &AcquireOutcome) -> GuardInfo {
        GuardInfo {
            execution_mode: self.execution_mode,
            rate_limit: RateLimitInfo {
                limit: rate.limit,
                remaining: rate.remaining,
                reset_at: rate.reset_at,
            },
            concurrency: ConcurrencyInfo {
                job_type: job_type.to_string(),
                active: slot.active_count(),
                max: slot.max_limit(),
            },
        }
    }
}

fn validate(attempt: &Attempt) -> Result<(), DispatchError> {
    if attempt.tool_id.trim().is_empty() {
        return Err(DispatchError::Validation("tool_id is required".to_string()));
    }
    if attempt.action.trim().is_empty() {
        return Err(DispatchError::Validation("action must not be empty".to_string()));
    }
    if !matches!(attempt.params, JsonValue::Object(_) | JsonValue::Null) {
        return Err(DispatchError::Validation("params must be a JSON object".to_string()));
    }
    Ok(())
}

fn invoke_failure(err: EngineError) -> DispatchError {
    DispatchError::invoke_failure(err.to_string())
}

/// Keep ledger rows small: large results are recorded by shape only.
fn summarize(value: &JsonValue) -> JsonValue {
    const MAX_INLINE: usize = 2048;
    match serde_json::to_string(value) {
        Ok(text) if text.len() <= MAX_INLINE => value.clone(),
        Ok(text) => json!({ "truncated": true, "bytes": text.len() }),
        Err(_) => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use tokio::sync::Semaphore;

    use dispatchgate_guards::{
        ConcurrencyLimits, KillSwitchScope, LogFilter, LogKind, Privileged, RateLimitPolicy,
    };

    use super::*;
    use crate::admission::ActivateKillSwitch;
    use crate::clock::{Clock, FakeClock};
    use crate::store::{ExecutionLogStore, InMemoryGuardStore};

    enum Behaviour {
        Succeed(JsonValue),
        Fail,
        Hang,
        /// Wait for a permit before succeeding.
        Gate(Arc<Semaphore>),
    }

    struct FakeEngine {
        behaviour: Behaviour,
        calls: Mutex<Vec<InvokeRequest>>,
    }

    impl FakeEngine {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl WorkflowEngine for FakeEngine {
        async fn invoke(&self, request: &InvokeRequest) -> Result<JsonValue, EngineError> {
            self.calls.lock().unwrap().push(request.clone());
            match &self.behaviour {
                Behaviour::Succeed(v) => Ok(v.clone()),
                Behaviour::Fail => Err(EngineError::Status {
                    status: 500,
                    body: "workflow crashed".to_string(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(JsonValue::Null)
                }
                Behaviour::Gate(gate) => {
                    let _permit = gate.acquire().await.map_err(|e| EngineError::Transport(e.to_string()))?;
                    Ok(json!({"ok": true}))
                }
            }
        }
    }

    struct Harness {
        coordinator: DispatchCoordinator,
        store: Arc<InMemoryGuardStore>,
        kill_switch: KillSwitch,
        clock: FakeClock,
    }

    fn harness(engine: Arc<dyn WorkflowEngine>, mode: ExecutionMode) -> Harness {
        let store = Arc::new(InMemoryGuardStore::new());
        let clock = FakeClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let audit = AuditLog::new(store.clone(), shared_clock.clone(), ChronoDuration::hours(1));
        let catalogue = Arc::new(ToolCatalogue::builtin());
        let kill_switch =
            KillSwitch::new(store.clone(), catalogue.clone(), audit.clone(), shared_clock.clone());
        let coordinator = DispatchCoordinator::new(
            catalogue,
            RateLimiter::new(store.clone(), RateLimitPolicy::new(5, 60).unwrap(), shared_clock.clone()),
            kill_switch.clone(),
            ConcurrencyGuard::new(
                store.clone(),
                ConcurrencyLimits::new(3).with_limit("listing", 2),
                audit.clone(),
                shared_clock,
            ),
            audit,
            engine,
            mode,
            Duration::from_millis(200),
        );
        Harness {
            coordinator,
            store,
            kill_switch,
            clock,
        }
    }

    async fn dispatch_logs(store: &InMemoryGuardStore) -> Vec<dispatchgate_guards::ExecutionLogEntry> {
        let filter = LogFilter {
            kind: Some(LogKind::Dispatch),
            ..LogFilter::default()
        };
        store.query_logs(&filter).await.unwrap()
    }

    async fn active(store: &InMemoryGuardStore, job_type: &str) -> u32 {
        use crate::store::JobLockStore;
        store
            .list_locks()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.job_type == job_type)
            .map(|l| l.active_count)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn admitted_sync_dispatch_completes_and_releases() {
        let engine = FakeEngine::new(Behaviour::Succeed(json!({"listed": 3})));
        let h = harness(engine.clone(), ExecutionMode::Full);

        let out = h
            .coordinator
            .dispatch(
                DispatchRequest::new("listingLocal").with_params(json!({"sku": "A1"})),
                Some("alice".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(out.tool_id, "listing-local");
        assert_eq!(out.job_type, "listing");
        assert_eq!(out.status, DispatchState::Completed);
        assert_eq!(out.result, Some(json!({"listed": 3})));
        assert_eq!(out.guard_info.concurrency.max, 2);
        assert_eq!(engine.calls(), 1);
        assert_eq!(active(&h.store, "listing").await, 0);

        let logs = dispatch_logs(&h.store).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Completed);
        assert_eq!(logs[0].metadata["fingerprint"], out.fingerprint);
    }

    #[tokio::test]
    async fn engine_failure_is_recorded_and_slot_freed() {
        let h = harness(FakeEngine::new(Behaviour::Fail), ExecutionMode::Full);

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-local"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVOKE_FAILURE");
        assert!(!err.is_guard_denial());
        assert_eq!(active(&h.store, "listing").await, 0);
        assert_eq!(dispatch_logs(&h.store).await[0].status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_is_an_invoke_failure_and_releases() {
        let h = harness(FakeEngine::new(Behaviour::Hang), ExecutionMode::Full);

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-local"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVOKE_FAILURE");
        assert!(err.to_string().contains("timed out"));
        assert_eq!(active(&h.store, "listing").await, 0);
    }

    #[tokio::test]
    async fn kill_switch_denies_with_reason_and_audits_blocked() {
        let engine = FakeEngine::new(Behaviour::Succeed(JsonValue::Null));
        let h = harness(engine.clone(), ExecutionMode::Full);
        let admin = Privileged::check(true, "ops", "killswitch.toggle").unwrap();
        h.kill_switch
            .activate(
                &admin,
                ActivateKillSwitch {
                    reason: "VERO spike detected".to_string(),
                    auto_resume_at: Some(h.clock.now() + ChronoDuration::seconds(3600)),
                    scope: KillSwitchScope::All,
                },
            )
            .await
            .unwrap();

        for tool in ["listing-local", "research-agent", "media-thumbnail"] {
            let err = h
                .coordinator
                .dispatch(DispatchRequest::new(tool), None)
                .await
                .unwrap_err();
            assert_eq!(err.context()["reason"], "VERO spike detected");
        }
        assert_eq!(engine.calls(), 0);

        let logs = dispatch_logs(&h.store).await;
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.status == LogStatus::Blocked));
        assert_eq!(logs[0].metadata["code"], "KILL_SWITCH_ACTIVE");

        // Past the auto-resume time the next dispatch goes through.
        h.clock.advance(ChronoDuration::seconds(3601));
        assert!(
            h.coordinator
                .dispatch(DispatchRequest::new("listing-local"), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn scoped_pause_of_legacy_alias_blocks_its_dispatch() {
        let engine = FakeEngine::new(Behaviour::Succeed(JsonValue::Null));
        let h = harness(engine.clone(), ExecutionMode::Full);
        let admin = Privileged::check(true, "ops", "killswitch.toggle").unwrap();
        h.kill_switch
            .activate(
                &admin,
                ActivateKillSwitch {
                    reason: "stock feed drift".to_string(),
                    auto_resume_at: None,
                    scope: KillSwitchScope::tools(["stockKiller"]),
                },
            )
            .await
            .unwrap();

        for tool in ["stockKiller", "stock-killer", "inventory-stock-sync"] {
            let err = h
                .coordinator
                .dispatch(DispatchRequest::new(tool), None)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "KILL_SWITCH_ACTIVE");
        }
        assert_eq!(engine.calls(), 0);
        assert!(
            h.coordinator
                .dispatch(DispatchRequest::new("listing-local"), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn caller_supplied_job_type_is_ignored() {
        let h = harness(
            FakeEngine::new(Behaviour::Succeed(JsonValue::Null)),
            ExecutionMode::Full,
        );
        let request: DispatchRequest =
            serde_json::from_value(json!({"tool_id": "listing-local", "job_type": "x"})).unwrap();

        let out = h.coordinator.dispatch(request, None).await.unwrap();
        assert_eq!(out.job_type, "listing");
        assert_eq!(out.guard_info.concurrency.job_type, "listing");
        assert_eq!(out.guard_info.concurrency.max, 2);
    }

    #[tokio::test]
    async fn local_only_mode_forbids_engine_dispatch() {
        let engine = FakeEngine::new(Behaviour::Succeed(JsonValue::Null));
        let h = harness(engine.clone(), ExecutionMode::LocalOnly);

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-local"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_MODE_FORBIDDEN");
        assert_eq!(err.context()["current_mode"], "local_only");
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn third_concurrent_listing_dispatch_is_denied() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = FakeEngine::new(Behaviour::Gate(gate.clone()));
        let h = harness(engine, ExecutionMode::Full);

        let first = tokio::spawn({
            let c = h.coordinator.clone();
            async move { c.dispatch(DispatchRequest::new("listing-local"), None).await }
        });
        let second = tokio::spawn({
            let c = h.coordinator.clone();
            async move { c.dispatch(DispatchRequest::new("listing-execute"), None).await }
        });
        while active(&h.store, "listing").await < 2 {
            tokio::task::yield_now().await;
        }

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-lp-auto"), None)
            .await
            .unwrap_err();
        assert_eq!(err.context()["current"], 2);
        assert_eq!(err.context()["max"], 2);

        gate.add_permits(2);
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(active(&h.store, "listing").await, 0);
        assert!(
            h.coordinator
                .dispatch(DispatchRequest::new("listing-lp-auto"), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn background_tools_return_pending_and_settle_later() {
        let h = harness(
            FakeEngine::new(Behaviour::Succeed(json!({"report": "done"}))),
            ExecutionMode::Full,
        );

        let out = h
            .coordinator
            .dispatch(DispatchRequest::new("researchAgent"), Some("bob".to_string()))
            .await
            .unwrap();
        assert_eq!(out.status, DispatchState::Pending);
        assert_eq!(out.job_type, "research");
        assert!(out.result.is_none());

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(row) = h.store.get_log(out.log_id).await.unwrap() {
                    if row.status.is_terminal() {
                        return row;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(settled.status, LogStatus::Completed);
        assert_eq!(settled.metadata["result"]["report"], "done");
        assert_eq!(active(&h.store, "research").await, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_and_audited_failed() {
        let engine = FakeEngine::new(Behaviour::Succeed(JsonValue::Null));
        let h = harness(engine.clone(), ExecutionMode::Full);

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("notATool"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::UnknownTool {
                tool_id: "not-a-tool".to_string()
            }
        );
        assert_eq!(engine.calls(), 0);
        let logs = dispatch_logs(&h.store).await;
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].tool_id, "not-a-tool");
    }

    #[tokio::test]
    async fn rate_limit_applies_per_caller() {
        let h = harness(FakeEngine::new(Behaviour::Succeed(JsonValue::Null)), ExecutionMode::Full);
        for _ in 0..5 {
            h.coordinator
                .dispatch(DispatchRequest::new("ddp-calculate"), Some("carol".to_string()))
                .await
                .unwrap();
        }
        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("ddp-calculate"), Some("carol".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert!(
            h.coordinator
                .dispatch(DispatchRequest::new("ddp-calculate"), Some("dave".to_string()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_closed_without_invoking() {
        let engine = FakeEngine::new(Behaviour::Succeed(JsonValue::Null));
        let h = harness(engine.clone(), ExecutionMode::Full);
        h.store.set_offline(true);

        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-local"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "GUARD_UNAVAILABLE");
        assert_eq!(err.context()["guard"], "rate_limiter");
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn non_object_params_are_rejected() {
        let h = harness(FakeEngine::new(Behaviour::Succeed(JsonValue::Null)), ExecutionMode::Full);
        let err = h
            .coordinator
            .dispatch(DispatchRequest::new("listing-local").with_params(json!([1, 2])), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn summary_reflects_kill_switch_and_mode() {
        let h = harness(FakeEngine::new(Behaviour::Succeed(JsonValue::Null)), ExecutionMode::Full);
        let summary = h.coordinator.summary().await.unwrap();
        assert!(summary.enabled);
        assert!(!summary.kill_switch_active);
        assert_eq!(summary.registered_tools, h.coordinator.catalogue().len());
    }
}
