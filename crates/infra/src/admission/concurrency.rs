use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use dispatchgate_core::HolderId;
use dispatchgate_guards::{
    AcquireOutcome, ConcurrencyLimits, DispatchError, GuardKind, JobLockSnapshot, Privileged,
    ReleaseOutcome,
};

use crate::admission::{AdminError, AuditLog, unavailable};
use crate::clock::Clock;
use crate::store::{JobLockStore, StoreError};

/// Dashboard view of every job type's slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyStatus {
    pub default_max_limit: u32,
    pub limits: std::collections::BTreeMap<String, u32>,
    pub locks: Vec<JobLockSnapshot>,
}

/// Per-job-type slot accounting.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn JobLockStore>,
    limits: ConcurrencyLimits,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl ConcurrencyGuard {
    pub fn new(
        store: Arc<dyn JobLockStore>,
        limits: ConcurrencyLimits,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limits,
            audit,
            clock,
        }
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        &self.limits
    }

    pub async fn acquire(
        &self,
        job_type: &str,
        holder: HolderId,
    ) -> Result<AcquireOutcome, DispatchError> {
        let max = self.limits.limit_for(job_type);
        let outcome = self
            .store
            .try_acquire(job_type, holder, max, self.clock.now())
            .await
            .map_err(unavailable(GuardKind::Concurrency))??;
        tracing::debug!(
            job_type,
            holder = %holder,
            active = outcome.active_count(),
            max = outcome.max_limit(),
            "concurrency slot acquired"
        );
        Ok(outcome)
    }

    /// Free the holder's slot. Releasing a slot that is not held is
    /// harmless and only logged.
    pub async fn release(
        &self,
        job_type: &str,
        holder: HolderId,
    ) -> Result<ReleaseOutcome, StoreError> {
        let outcome = self.store.release(job_type, holder, self.clock.now()).await?;
        if let ReleaseOutcome::NotHeld { active_count } = outcome {
            tracing::warn!(job_type, holder = %holder, active_count, "release for a slot that was not held");
        }
        Ok(outcome)
    }

    /// Zero one job type (or all of them) after workers died holding slots.
    pub async fn reset(
        &self,
        who: &Privileged,
        job_type: Option<&str>,
    ) -> Result<Vec<String>, AdminError> {
        let touched = self.store.reset(job_type, self.clock.now()).await?;
        tracing::warn!(actor = who.actor(), job_type = ?job_type, reset = ?touched, "concurrency counters reset");
        self.audit
            .record_admin(
                "concurrency.reset",
                who.actor(),
                json!({ "job_type": job_type, "reset": touched }),
            )
            .await?;
        Ok(touched)
    }

    pub async fn status(&self) -> Result<ConcurrencyStatus, StoreError> {
        Ok(ConcurrencyStatus {
            default_max_limit: self.limits.default_max,
            limits: self.limits.overrides.clone(),
            locks: self.store.list_locks().await?,
        })
    }
}
