//! Fixed-window request throttle.
//!
//! Windows are aligned to multiples of the window length since the Unix epoch,
//! so every instance computes the same `window_start` for a given `now` and a
//! bucket can be keyed by `(key, window_start)` in shared storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use dispatchgate_core::DomainError;

use crate::error::RateLimitedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 60,
            window_secs: 60,
        }
    }
}

impl RateLimitPolicy {
    /// Longest accepted window (one week).
    pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 3600;

    pub fn new(limit: u32, window_secs: u64) -> Result<Self, DomainError> {
        if limit == 0 {
            return Err(DomainError::validation("rate limit must be at least 1"));
        }
        if window_secs == 0 {
            return Err(DomainError::validation("rate window must be at least 1 second"));
        }
        if window_secs > Self::MAX_WINDOW_SECS {
            return Err(DomainError::validation(format!(
                "rate window must be at most {} seconds",
                Self::MAX_WINDOW_SECS
            )));
        }
        Ok(Self { limit, window_secs })
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.bounded_secs())
    }

    /// Start of the aligned window containing `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = self.bounded_secs();
        let secs = now.timestamp().div_euclid(window) * window;
        DateTime::from_timestamp(secs, 0).unwrap_or(now)
    }

    // The fields are public, so a hand-built policy may bypass `new`.
    fn bounded_secs(&self) -> i64 {
        self.window_secs.clamp(1, Self::MAX_WINDOW_SECS) as i64
    }
}

/// Request counter for one key in one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub key: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
}

impl RateLimitBucket {
    pub fn new(key: impl Into<String>, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            window_start: policy.window_start(now),
            count: 0,
            limit: policy.limit,
        }
    }

    /// Count one request. A bucket from an older window starts over.
    ///
    /// The counter keeps increasing past the limit so the denial reports the
    /// real request volume; storage applies the same rule with a single upsert.
    pub fn hit(&mut self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> RateDecision {
        let window_start = policy.window_start(now);
        if self.window_start != window_start {
            self.window_start = window_start;
            self.count = 0;
        }
        self.limit = policy.limit;
        self.count = self.count.saturating_add(1);

        RateDecision::from_count(&self.key, self.count, policy, window_start, now)
    }
}

/// Outcome of counting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub key: String,
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window_secs: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl RateDecision {
    pub fn from_count(
        key: &str,
        count: u32,
        policy: &RateLimitPolicy,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let reset_at = window_start + policy.window();
        let retry_after_secs = (reset_at - now).num_seconds().max(1) as u64;
        Self {
            key: key.to_string(),
            allowed: count <= policy.limit,
            count,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(count),
            window_secs: policy.window_secs,
            reset_at,
            retry_after_secs,
        }
    }

    pub fn into_result(self) -> Result<RateDecision, RateLimitedError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitedError {
                key: self.key,
                count: self.count,
                limit: self.limit,
                window_secs: self.window_secs,
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn windows_are_epoch_aligned() {
        let policy = RateLimitPolicy::new(5, 60).unwrap();
        // 1_770_000_000 is a multiple of 60.
        assert_eq!(policy.window_start(at(0)), at(0));
        assert_eq!(policy.window_start(at(59)), at(0));
        assert_eq!(policy.window_start(at(60)), at(60));
    }

    #[test]
    fn denies_after_limit_within_window() {
        let policy = RateLimitPolicy::new(2, 60).unwrap();
        let mut bucket = RateLimitBucket::new("user-1", &policy, at(0));

        assert!(bucket.hit(&policy, at(1)).allowed);
        assert!(bucket.hit(&policy, at(2)).allowed);

        let denied = bucket.hit(&policy, at(10));
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);
        assert_eq!(denied.retry_after_secs, 50);

        let err = denied.into_result().unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(err.key, "user-1");
    }

    #[test]
    fn next_window_starts_over() {
        let policy = RateLimitPolicy::new(1, 60).unwrap();
        let mut bucket = RateLimitBucket::new("user-1", &policy, at(0));
        assert!(bucket.hit(&policy, at(0)).allowed);
        assert!(!bucket.hit(&policy, at(30)).allowed);

        let fresh = bucket.hit(&policy, at(61));
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
        assert_eq!(bucket.window_start, at(60));
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(RateLimitPolicy::new(0, 60).is_err());
        assert!(RateLimitPolicy::new(10, 0).is_err());
    }

    #[test]
    fn oversized_windows_are_rejected() {
        assert!(RateLimitPolicy::new(10, RateLimitPolicy::MAX_WINDOW_SECS).is_ok());
        assert!(RateLimitPolicy::new(10, RateLimitPolicy::MAX_WINDOW_SECS + 1).is_err());
        assert!(RateLimitPolicy::new(10, 10_000_000_000_000_000).is_err());
        assert!(RateLimitPolicy::new(10, u64::MAX).is_err());

        let hand_built = RateLimitPolicy {
            limit: 10,
            window_secs: u64::MAX,
        };
        assert_eq!(
            hand_built.window(),
            Duration::seconds(RateLimitPolicy::MAX_WINDOW_SECS as i64)
        );
        let _ = hand_built.window_start(at(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn allows_exactly_limit_per_window(limit in 1u32..20, extra in 0u32..20) {
            let policy = RateLimitPolicy::new(limit, 60).unwrap();
            let mut bucket = RateLimitBucket::new("k", &policy, at(0));
            let allowed = (0..limit + extra)
                .filter(|_| bucket.hit(&policy, at(5)).allowed)
                .count() as u32;
            prop_assert_eq!(allowed, limit);
        }
    }
}
