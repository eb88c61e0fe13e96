use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use dispatchgate_core::ExpectedVersion;
use dispatchgate_guards::{
    DispatchError, GuardKind, KillSwitchScope, KillSwitchState, Privileged, ToolCatalogue,
};

use crate::admission::{AdminError, AuditLog, unavailable};
use crate::clock::Clock;
use crate::store::{KillSwitchStore, StoreError};

/// Activation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateKillSwitch {
    pub reason: String,
    #[serde(default)]
    pub auto_resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: KillSwitchScope,
}

/// Global (or tool-scoped) emergency stop backed by the singleton row.
#[derive(Clone)]
pub struct KillSwitch {
    store: Arc<dyn KillSwitchStore>,
    catalogue: Arc<ToolCatalogue>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
}

impl KillSwitch {
    pub fn new(
        store: Arc<dyn KillSwitchStore>,
        catalogue: Arc<ToolCatalogue>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalogue,
            audit,
            clock,
        }
    }

    /// Current effective state. An expired auto-resume is written back as
    /// deactivated; losing that write to a concurrent change reloads once.
    pub async fn status(&self) -> Result<KillSwitchState, StoreError> {
        let now = self.clock.now();
        let stored = self.store.load_kill_switch().await?;
        let evaluation = stored.evaluate(now);
        if !evaluation.auto_resumed {
            return Ok(evaluation.effective);
        }

        match self
            .store
            .save_kill_switch(&evaluation.effective, ExpectedVersion::Exact(stored.version))
            .await
        {
            Ok(true) => {
                tracing::info!(
                    reason = ?stored.reason,
                    auto_resume_at = ?stored.auto_resume_at,
                    "kill switch auto-resumed"
                );
                Ok(evaluation.effective)
            }
            Ok(false) => {
                let current = self.store.load_kill_switch().await?;
                Ok(current.evaluate(now).effective)
            }
            Err(err) => {
                // The expiry is still honoured for this read.
                tracing::warn!(error = %err, "failed to persist kill switch auto-resume");
                Ok(evaluation.effective)
            }
        }
    }

    pub async fn is_blocked(&self, tool_id: &str) -> Result<bool, StoreError> {
        let tool_id = self.catalogue.normalize_tool_id(tool_id);
        Ok(self.status().await?.is_blocked(&tool_id))
    }

    /// Admission check. An unreadable switch blocks.
    pub async fn check(&self, tool_id: &str) -> Result<(), DispatchError> {
        let tool_id = self.catalogue.normalize_tool_id(tool_id);
        let state = self
            .status()
            .await
            .map_err(unavailable(GuardKind::KillSwitch))?;
        state.check(&tool_id)?;
        Ok(())
    }

    pub async fn activate(
        &self,
        who: &Privileged,
        request: ActivateKillSwitch,
    ) -> Result<KillSwitchState, AdminError> {
        let scope = request.scope.normalized(&self.catalogue)?;
        let now = self.clock.now();
        let current = self.status().await?;
        let next = current.activated(
            request.reason,
            who.actor(),
            request.auto_resume_at,
            scope,
            now,
        )?;
        self.save(&current, &next).await?;

        tracing::warn!(
            actor = who.actor(),
            reason = ?next.reason,
            auto_resume_at = ?next.auto_resume_at,
            scope = ?next.scope,
            "kill switch activated"
        );
        self.audit
            .record_admin(
                "kill_switch.activate",
                who.actor(),
                json!({
                    "reason": next.reason,
                    "auto_resume_at": next.auto_resume_at,
                    "scope": next.scope,
                    "version": next.version,
                }),
            )
            .await?;
        Ok(next)
    }

    pub async fn deactivate(&self, who: &Privileged) -> Result<KillSwitchState, AdminError> {
        let now = self.clock.now();
        let current = self.status().await?;
        let next = current.deactivated(now);
        self.save(&current, &next).await?;

        tracing::info!(actor = who.actor(), was_active = current.active, "kill switch deactivated");
        self.audit
            .record_admin(
                "kill_switch.deactivate",
                who.actor(),
                json!({
                    "was_active": current.active,
                    "previous_reason": current.reason,
                    "version": next.version,
                }),
            )
            .await?;
        Ok(next)
    }

    async fn save(&self, current: &KillSwitchState, next: &KillSwitchState) -> Result<(), AdminError> {
        let saved = self
            .store
            .save_kill_switch(next, ExpectedVersion::Exact(current.version))
            .await?;
        if !saved {
            return Err(AdminError::Conflict(format!(
                "kill switch changed since version {}",
                current.version
            )));
        }
        Ok(())
    }
}
