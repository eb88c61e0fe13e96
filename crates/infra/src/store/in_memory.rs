//! In-memory guard store for tests and single-instance dev runs.
//!
//! Each operation holds the relevant lock for its whole read-modify-write, so
//! the conditional semantics match the Postgres store within one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use dispatchgate_core::{ExecutionLogId, ExpectedVersion, HolderId};
use dispatchgate_guards::{
    ExecutionLogEntry, JobLock, JobLockSnapshot, KillSwitchState, LogFilter, LogKind, LogStatus,
    RateDecision, RateLimitBucket, RateLimitPolicy, ReleaseOutcome,
};

use super::{
    AcquireResult, ExecutionLogStore, JobLockStore, KillSwitchStore, RateLimitStore, StoreError,
};

#[derive(Debug, Default)]
pub struct InMemoryGuardStore {
    locks: Mutex<BTreeMap<String, JobLock>>,
    kill_switch: RwLock<KillSwitchState>,
    logs: RwLock<HashMap<ExecutionLogId, ExecutionLogEntry>>,
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
    offline: AtomicBool,
}

impl InMemoryGuardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn online(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::unavailable(operation, "in-memory store offline"))
        } else {
            Ok(())
        }
    }

    fn locks(&self, operation: &'static str) -> Result<MutexGuard<'_, BTreeMap<String, JobLock>>, StoreError> {
        self.online(operation)?;
        self.locks
            .lock()
            .map_err(|_| StoreError::unavailable(operation, "job lock table poisoned"))
    }

    fn logs_read(
        &self,
        operation: &'static str,
    ) -> Result<RwLockReadGuard<'_, HashMap<ExecutionLogId, ExecutionLogEntry>>, StoreError> {
        self.online(operation)?;
        self.logs
            .read()
            .map_err(|_| StoreError::unavailable(operation, "execution log table poisoned"))
    }

    fn logs_write(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, HashMap<ExecutionLogId, ExecutionLogEntry>>, StoreError> {
        self.online(operation)?;
        self.logs
            .write()
            .map_err(|_| StoreError::unavailable(operation, "execution log table poisoned"))
    }
}

fn newest_first(rows: &mut [ExecutionLogEntry]) {
    rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
}

#[async_trait::async_trait]
impl JobLockStore for InMemoryGuardStore {
    async fn try_acquire(
        &self,
        job_type: &str,
        holder: HolderId,
        max_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<AcquireResult, StoreError> {
        let mut locks = self.locks("try_acquire")?;
        let lock = locks
            .entry(job_type.to_string())
            .or_insert_with(|| JobLock::new(job_type, max_limit, now));
        lock.apply_limit(max_limit);
        Ok(lock.try_acquire(holder, now))
    }

    async fn release(
        &self,
        job_type: &str,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut locks = self.locks("release")?;
        Ok(match locks.get_mut(job_type) {
            Some(lock) => lock.release(holder, now),
            None => ReleaseOutcome::NotHeld { active_count: 0 },
        })
    }

    async fn reset(
        &self,
        job_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut locks = self.locks("reset")?;
        let mut touched = Vec::new();
        for (name, lock) in locks.iter_mut() {
            if job_type.is_none_or(|t| t == name) {
                lock.reset(now);
                touched.push(name.clone());
            }
        }
        Ok(touched)
    }

    async fn list_locks(&self) -> Result<Vec<JobLockSnapshot>, StoreError> {
        let locks = self.locks("list_locks")?;
        Ok(locks.values().map(JobLock::snapshot).collect())
    }
}

#[async_trait::async_trait]
impl KillSwitchStore for InMemoryGuardStore {
    async fn load_kill_switch(&self) -> Result<KillSwitchState, StoreError> {
        self.online("load_kill_switch")?;
        let state = self
            .kill_switch
            .read()
            .map_err(|_| StoreError::unavailable("load_kill_switch", "kill switch poisoned"))?;
        Ok(state.clone())
    }

    async fn save_kill_switch(
        &self,
        next: &KillSwitchState,
        expected: ExpectedVersion,
    ) -> Result<bool, StoreError> {
        self.online("save_kill_switch")?;
        let mut state = self
            .kill_switch
            .write()
            .map_err(|_| StoreError::unavailable("save_kill_switch", "kill switch poisoned"))?;
        if !expected.matches(state.version) {
            return Ok(false);
        }
        *state = next.clone();
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ExecutionLogStore for InMemoryGuardStore {
    async fn insert_log(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        let mut logs = self.logs_write("insert_log")?;
        if logs.contains_key(&entry.id) {
            return Err(StoreError::Conflict(format!(
                "execution log {} already exists",
                entry.id
            )));
        }
        logs.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn complete_log(
        &self,
        id: ExecutionLogId,
        status: LogStatus,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<ExecutionLogEntry, StoreError> {
        let mut logs = self.logs_write("complete_log")?;
        let entry = logs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.complete(status, metadata, now)?;
        Ok(entry.clone())
    }

    async fn get_log(&self, id: ExecutionLogId) -> Result<Option<ExecutionLogEntry>, StoreError> {
        let logs = self.logs_read("get_log")?;
        Ok(logs.get(&id).cloned())
    }

    async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let logs = self.logs_read("query_logs")?;
        let mut rows: Vec<ExecutionLogEntry> =
            logs.values().filter(|e| filter.matches(e)).cloned().collect();
        newest_first(&mut rows);
        rows.truncate(filter.limit as usize);
        Ok(rows)
    }

    async fn logs_since(
        &self,
        since: DateTime<Utc>,
        kind: Option<LogKind>,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let logs = self.logs_read("logs_since")?;
        let mut rows: Vec<ExecutionLogEntry> = logs
            .values()
            .filter(|e| e.started_at >= since && kind.is_none_or(|k| e.kind == k))
            .cloned()
            .collect();
        newest_first(&mut rows);
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl RateLimitStore for InMemoryGuardStore {
    async fn hit(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError> {
        self.online("rate_limit_hit")?;
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::unavailable("rate_limit_hit", "rate limit table poisoned"))?;
        // Buckets from earlier windows would only reset on their next hit.
        let current = policy.window_start(now);
        buckets.retain(|_, b| b.window_start >= current);
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateLimitBucket::new(key, policy, now));
        Ok(bucket.hit(policy, now))
    }
}
