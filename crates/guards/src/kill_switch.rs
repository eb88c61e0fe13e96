//! Kill-switch state and its lazy auto-resume evaluation.
//!
//! The stored state is never polled by a timer. Every read calls
//! [`KillSwitchState::evaluate`] with the current time; if `auto_resume_at` has
//! passed, the evaluation reports the switch as inactive and flags that the
//! stored row should be written back.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispatchgate_core::DomainError;

use crate::error::KillSwitchActiveError;
use crate::tool::ToolCatalogue;

/// What an active kill switch blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tools", rename_all = "snake_case")]
pub enum KillSwitchScope {
    /// Every tool.
    #[default]
    All,
    /// Only the listed tool ids.
    Tools(BTreeSet<String>),
}

impl KillSwitchScope {
    pub fn tools<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tools(ids.into_iter().map(Into::into).collect())
    }

    pub fn covers(&self, tool_id: &str) -> bool {
        match self {
            KillSwitchScope::All => true,
            KillSwitchScope::Tools(ids) => ids.contains(tool_id),
        }
    }

    /// Rewrite listed ids into the catalogue's canonical form so that aliases
    /// and camelCase ids pause the same tool admission checks. Ids that do not
    /// resolve to a registered tool are rejected.
    pub fn normalized(self, catalogue: &ToolCatalogue) -> Result<Self, DomainError> {
        let ids = match self {
            KillSwitchScope::All => return Ok(KillSwitchScope::All),
            KillSwitchScope::Tools(ids) => ids,
        };
        let mut normalized = BTreeSet::new();
        for raw in ids {
            if catalogue.resolve(&raw).is_err() {
                return Err(DomainError::validation(format!(
                    "cannot pause unknown tool '{raw}'"
                )));
            }
            normalized.insert(catalogue.normalize_tool_id(&raw));
        }
        Ok(KillSwitchScope::Tools(normalized))
    }

    /// The paused tool set (`None` means every tool).
    pub fn paused_tools(&self) -> Option<&BTreeSet<String>> {
        match self {
            KillSwitchScope::All => None,
            KillSwitchScope::Tools(ids) => Some(ids),
        }
    }
}

/// Singleton kill-switch row.
///
/// Invariant: `active` implies `activated_at.is_some()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub auto_resume_at: Option<DateTime<Utc>>,
    pub scope: KillSwitchScope,
    /// Incremented on every stored write; used for conditional write-back.
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self::inactive()
    }
}

/// Result of evaluating the stored state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchEvaluation {
    /// The state to act on for this read.
    pub effective: KillSwitchState,
    /// `auto_resume_at` elapsed: storage still says active and should be written back.
    pub auto_resumed: bool,
}

impl KillSwitchState {
    pub fn inactive() -> Self {
        Self {
            active: false,
            reason: None,
            activated_at: None,
            activated_by: None,
            auto_resume_at: None,
            scope: KillSwitchScope::All,
            version: 0,
            updated_at: None,
        }
    }

    /// Build the next stored state for an activation.
    pub fn activated(
        &self,
        reason: impl Into<String>,
        activated_by: impl Into<String>,
        auto_resume_at: Option<DateTime<Utc>>,
        scope: KillSwitchScope,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(DomainError::validation("kill switch reason must not be empty"));
        }
        if let Some(at) = auto_resume_at {
            if at <= now {
                return Err(DomainError::validation(
                    "auto_resume_at must be in the future",
                ));
            }
        }
        if let KillSwitchScope::Tools(ids) = &scope {
            if ids.is_empty() {
                return Err(DomainError::validation(
                    "scoped kill switch needs at least one tool id",
                ));
            }
        }

        Ok(Self {
            active: true,
            reason: Some(reason),
            activated_at: Some(now),
            activated_by: Some(activated_by.into()),
            auto_resume_at,
            scope,
            version: self.version + 1,
            updated_at: Some(now),
        })
    }

    /// Build the next stored state for a deactivation.
    pub fn deactivated(&self, now: DateTime<Utc>) -> Self {
        Self {
            version: self.version + 1,
            updated_at: Some(now),
            ..Self::inactive()
        }
    }

    /// Recompute the effective state from `(stored, now)`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> KillSwitchEvaluation {
        match self.auto_resume_at {
            Some(at) if self.active && at <= now => KillSwitchEvaluation {
                effective: self.deactivated(now),
                auto_resumed: true,
            },
            _ => KillSwitchEvaluation {
                effective: self.clone(),
                auto_resumed: false,
            },
        }
    }

    /// Whether `tool_id` is blocked by this (already evaluated) state.
    pub fn is_blocked(&self, tool_id: &str) -> bool {
        self.active && self.scope.covers(tool_id)
    }

    /// Deny `tool_id` with the stored reason when blocked.
    pub fn check(&self, tool_id: &str) -> Result<(), KillSwitchActiveError> {
        if !self.is_blocked(tool_id) {
            return Ok(());
        }
        Err(KillSwitchActiveError {
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| "kill switch active".to_string()),
            activated_by: self.activated_by.clone(),
            activated_at: self.activated_at,
            auto_resume_at: self.auto_resume_at,
        })
    }

    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.active && self.activated_at.is_none() {
            return Err(DomainError::invariant(
                "active kill switch must record activated_at",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn activation_blocks_every_tool_by_default() {
        let state = KillSwitchState::inactive()
            .activated("VERO spike detected", "ops", None, KillSwitchScope::All, now())
            .unwrap();

        assert!(state.is_blocked("listing-local"));
        assert!(state.is_blocked("stock-killer"));
        assert!(state.check_invariants().is_ok());

        let err = state.check("listing-local").unwrap_err();
        assert_eq!(err.reason, "VERO spike detected");
        assert_eq!(err.activated_by.as_deref(), Some("ops"));
    }

    #[test]
    fn scoped_activation_leaves_other_tools_alone() {
        let state = KillSwitchState::inactive()
            .activated(
                "ebay outage",
                "ops",
                None,
                KillSwitchScope::tools(["ebay-listing"]),
                now(),
            )
            .unwrap();

        assert!(state.is_blocked("ebay-listing"));
        assert!(!state.is_blocked("qoo10-listing"));
        assert!(state.check("qoo10-listing").is_ok());
    }

    #[test]
    fn auto_resume_in_the_future_stays_active() {
        let state = KillSwitchState::inactive()
            .activated(
                "VERO spike detected",
                "ops",
                Some(now() + Duration::seconds(3600)),
                KillSwitchScope::All,
                now(),
            )
            .unwrap();

        let eval = state.evaluate(now() + Duration::seconds(60));
        assert!(!eval.auto_resumed);
        assert!(eval.effective.is_blocked("listing-local"));
    }

    #[test]
    fn elapsed_auto_resume_reads_as_inactive_and_requests_write_back() {
        let state = KillSwitchState::inactive()
            .activated(
                "maintenance",
                "ops",
                Some(now() + Duration::seconds(10)),
                KillSwitchScope::All,
                now(),
            )
            .unwrap();

        let eval = state.evaluate(now() + Duration::seconds(11));
        assert!(eval.auto_resumed);
        assert!(!eval.effective.active);
        assert!(!eval.effective.is_blocked("listing-local"));
        assert_eq!(eval.effective.version, state.version + 1);
    }

    #[test]
    fn evaluating_an_inactive_switch_never_writes() {
        let eval = KillSwitchState::inactive().evaluate(now());
        assert!(!eval.auto_resumed);
        assert_eq!(eval.effective, KillSwitchState::inactive());
    }

    #[test]
    fn rejects_invalid_activations() {
        let base = KillSwitchState::inactive();
        assert!(base.activated("  ", "ops", None, KillSwitchScope::All, now()).is_err());
        assert!(base
            .activated("x", "ops", Some(now()), KillSwitchScope::All, now())
            .is_err());
        assert!(base
            .activated("x", "ops", None, KillSwitchScope::Tools(BTreeSet::new()), now())
            .is_err());
    }

    #[test]
    fn deactivation_bumps_version_and_clears_context() {
        let active = KillSwitchState::inactive()
            .activated("x", "ops", None, KillSwitchScope::All, now())
            .unwrap();
        let inactive = active.deactivated(now());

        assert!(!inactive.active);
        assert!(inactive.reason.is_none());
        assert_eq!(inactive.version, active.version + 1);
    }

    #[test]
    fn scope_is_rewritten_to_canonical_tool_ids() {
        let catalogue = ToolCatalogue::builtin();
        let scope = KillSwitchScope::tools(["stockKiller", "inventory-stock-sync", "listingLocal"])
            .normalized(&catalogue)
            .unwrap();

        assert_eq!(
            scope.paused_tools().unwrap().iter().collect::<Vec<_>>(),
            vec!["listing-local", "stock-killer"]
        );
        assert!(scope.covers("stock-killer"));
        assert!(KillSwitchScope::tools(["no-such-tool"]).normalized(&catalogue).is_err());
        assert_eq!(
            KillSwitchScope::All.normalized(&catalogue).unwrap(),
            KillSwitchScope::All
        );
    }
}
