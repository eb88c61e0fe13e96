//! Per-job-type concurrency ceilings.
//!
//! A [`JobLock`] is one row per job type. Its transitions are written here as
//! pure methods; stores apply them under a single atomic conditional update so
//! that two concurrent callers can never both observe room and both succeed.
//!
//! Invariants (checked by [`JobLock::check_invariants`]):
//! - `active_count == holders.len()`
//! - `0 <= active_count <= max_limit`

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispatchgate_core::{DomainError, HolderId};

use crate::error::ConcurrencyLimitError;

/// One job type's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub job_type: String,
    pub active_count: u32,
    pub max_limit: u32,
    pub holders: BTreeSet<HolderId>,
    pub updated_at: DateTime<Utc>,
}

/// Successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A new slot was taken; `active_count` after the increment.
    Acquired { active_count: u32, max_limit: u32 },
    /// The holder already owned a slot; nothing changed.
    AlreadyHeld { active_count: u32, max_limit: u32 },
}

impl AcquireOutcome {
    pub fn active_count(&self) -> u32 {
        match self {
            AcquireOutcome::Acquired { active_count, .. }
            | AcquireOutcome::AlreadyHeld { active_count, .. } => *active_count,
        }
    }

    pub fn max_limit(&self) -> u32 {
        match self {
            AcquireOutcome::Acquired { max_limit, .. }
            | AcquireOutcome::AlreadyHeld { max_limit, .. } => *max_limit,
        }
    }
}

/// Release result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The holder's slot was freed.
    Released { active_count: u32 },
    /// The holder did not own a slot (double release or post-reset release).
    /// Counters are left untouched.
    NotHeld { active_count: u32 },
}

impl JobLock {
    pub fn new(job_type: impl Into<String>, max_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_type: job_type.into(),
            active_count: 0,
            max_limit,
            holders: BTreeSet::new(),
            updated_at: now,
        }
    }

    /// Increment only if `active_count < max_limit`.
    pub fn try_acquire(
        &mut self,
        holder: HolderId,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, ConcurrencyLimitError> {
        if self.holders.contains(&holder) {
            return Ok(AcquireOutcome::AlreadyHeld {
                active_count: self.active_count,
                max_limit: self.max_limit,
            });
        }
        if self.active_count >= self.max_limit {
            return Err(ConcurrencyLimitError {
                job_type: self.job_type.clone(),
                current: self.active_count,
                max: self.max_limit,
            });
        }

        self.holders.insert(holder);
        self.active_count = self.holders.len() as u32;
        self.updated_at = now;
        Ok(AcquireOutcome::Acquired {
            active_count: self.active_count,
            max_limit: self.max_limit,
        })
    }

    /// Idempotent decrement, clamped at zero.
    pub fn release(&mut self, holder: HolderId, now: DateTime<Utc>) -> ReleaseOutcome {
        if !self.holders.remove(&holder) {
            return ReleaseOutcome::NotHeld {
                active_count: self.active_count,
            };
        }
        self.active_count = self.holders.len() as u32;
        self.updated_at = now;
        ReleaseOutcome::Released {
            active_count: self.active_count,
        }
    }

    /// Administrative zeroing (crashed workers that never released).
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.holders.clear();
        self.active_count = 0;
        self.updated_at = now;
    }

    /// Adopt the configured ceiling. Never drops below the slots currently
    /// held; a lowered limit takes effect as holders drain.
    pub fn apply_limit(&mut self, configured: u32) {
        self.max_limit = configured.max(self.active_count);
    }

    pub fn snapshot(&self) -> JobLockSnapshot {
        JobLockSnapshot {
            job_type: self.job_type.clone(),
            active_count: self.active_count,
            max_limit: self.max_limit,
            available: self.max_limit.saturating_sub(self.active_count),
            holders: self.holders.iter().copied().collect(),
            updated_at: self.updated_at,
        }
    }

    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.active_count as usize != self.holders.len() {
            return Err(DomainError::invariant(format!(
                "job lock '{}' active_count {} != holders {}",
                self.job_type,
                self.active_count,
                self.holders.len()
            )));
        }
        if self.active_count > self.max_limit {
            return Err(DomainError::invariant(format!(
                "job lock '{}' active_count {} exceeds max_limit {}",
                self.job_type, self.active_count, self.max_limit
            )));
        }
        Ok(())
    }
}

/// Read-only view of a job lock for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLockSnapshot {
    pub job_type: String,
    pub active_count: u32,
    pub max_limit: u32,
    pub available: u32,
    pub holders: Vec<HolderId>,
    pub updated_at: DateTime<Utc>,
}

/// Configured ceilings per job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub default_max: u32,
    pub overrides: BTreeMap<String, u32>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            default_max: 3,
            overrides: BTreeMap::new(),
        }
    }
}

impl ConcurrencyLimits {
    pub fn new(default_max: u32) -> Self {
        Self {
            default_max,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_limit(mut self, job_type: impl Into<String>, max: u32) -> Self {
        self.overrides.insert(job_type.into(), max);
        self
    }

    pub fn limit_for(&self, job_type: &str) -> u32 {
        self.overrides
            .get(job_type)
            .copied()
            .unwrap_or(self.default_max)
    }

    /// Parse overrides in `type=n,type=n` form.
    pub fn parse_overrides(&mut self, raw: &str) -> Result<(), DomainError> {
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (job_type, max) = pair.split_once('=').ok_or_else(|| {
                DomainError::validation(format!("expected job_type=limit, got '{pair}'"))
            })?;
            let max: u32 = max.trim().parse().map_err(|_| {
                DomainError::validation(format!("limit for '{}' is not a number", job_type.trim()))
            })?;
            self.overrides.insert(job_type.trim().to_string(), max);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn lock(max: u32) -> JobLock {
        JobLock::new("listing", max, Utc::now())
    }

    #[test]
    fn third_acquire_at_limit_two_is_denied_with_numbers() {
        let mut l = lock(2);
        l.try_acquire(HolderId::new(), Utc::now()).unwrap();
        l.try_acquire(HolderId::new(), Utc::now()).unwrap();

        let err = l.try_acquire(HolderId::new(), Utc::now()).unwrap_err();
        assert_eq!(err.job_type, "listing");
        assert_eq!(err.current, 2);
        assert_eq!(err.max, 2);
    }

    #[test]
    fn release_then_retry_succeeds() {
        let mut l = lock(2);
        let a = HolderId::new();
        l.try_acquire(a, Utc::now()).unwrap();
        l.try_acquire(HolderId::new(), Utc::now()).unwrap();
        assert!(l.try_acquire(HolderId::new(), Utc::now()).is_err());

        assert!(matches!(
            l.release(a, Utc::now()),
            ReleaseOutcome::Released { active_count: 1 }
        ));
        assert!(l.try_acquire(HolderId::new(), Utc::now()).is_ok());
    }

    #[test]
    fn double_release_clamps_at_zero() {
        let mut l = lock(1);
        let h = HolderId::new();
        l.try_acquire(h, Utc::now()).unwrap();

        assert!(matches!(l.release(h, Utc::now()), ReleaseOutcome::Released { .. }));
        assert!(matches!(
            l.release(h, Utc::now()),
            ReleaseOutcome::NotHeld { active_count: 0 }
        ));
        assert_eq!(l.active_count, 0);
    }

    #[test]
    fn reacquire_by_same_holder_does_not_double_count() {
        let mut l = lock(2);
        let h = HolderId::new();
        l.try_acquire(h, Utc::now()).unwrap();
        let again = l.try_acquire(h, Utc::now()).unwrap();

        assert!(matches!(again, AcquireOutcome::AlreadyHeld { active_count: 1, .. }));
        assert!(l.check_invariants().is_ok());
    }

    #[test]
    fn reset_zeroes_counters() {
        let mut l = lock(3);
        l.try_acquire(HolderId::new(), Utc::now()).unwrap();
        l.try_acquire(HolderId::new(), Utc::now()).unwrap();
        l.reset(Utc::now());

        assert_eq!(l.active_count, 0);
        assert!(l.holders.is_empty());
        assert_eq!(l.snapshot().available, 3);
    }

    #[test]
    fn limits_parse_overrides() {
        let mut limits = ConcurrencyLimits::new(3);
        limits.parse_overrides("listing=2, research = 5,").unwrap();

        assert_eq!(limits.limit_for("listing"), 2);
        assert_eq!(limits.limit_for("research"), 5);
        assert_eq!(limits.limit_for("media"), 3);
        assert!(limits.parse_overrides("listing").is_err());
        assert!(limits.parse_overrides("listing=two").is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Release(usize),
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..6).prop_map(Op::Acquire),
            3 => (0usize..6).prop_map(Op::Release),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any interleaving of acquire/release/reset keeps
        /// `0 <= active_count <= max_limit` and `active_count == |holders|`.
        #[test]
        fn counters_stay_within_bounds(
            max in 0u32..5,
            ops in prop::collection::vec(op(), 0..64)
        ) {
            let holders: Vec<HolderId> = (0..6).map(|_| HolderId::new()).collect();
            let mut l = lock(max);

            for op in ops {
                match op {
                    Op::Acquire(i) => { let _ = l.try_acquire(holders[i], Utc::now()); }
                    Op::Release(i) => { let _ = l.release(holders[i], Utc::now()); }
                    Op::Reset => l.reset(Utc::now()),
                }
                prop_assert!(l.check_invariants().is_ok());
                prop_assert!(l.active_count <= l.max_limit);
            }
        }

        /// Property: acquire followed by release restores the prior count.
        #[test]
        fn acquire_release_is_neutral(max in 1u32..5, pre in 0u32..4) {
            let mut l = lock(max);
            for _ in 0..pre.min(max - 1) {
                l.try_acquire(HolderId::new(), Utc::now()).unwrap();
            }
            let before = l.active_count;
            let h = HolderId::new();
            l.try_acquire(h, Utc::now()).unwrap();
            l.release(h, Utc::now());
            prop_assert_eq!(l.active_count, before);
        }
    }
}
