use std::sync::Arc;

use dispatchgate_guards::{DispatchError, GuardKind, RateDecision, RateLimitPolicy};

use crate::admission::unavailable;
use crate::clock::Clock;
use crate::store::RateLimitStore;

/// Fixed-window request budget keyed by caller.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Count one request against `key`.
    pub async fn check(&self, key: &str) -> Result<RateDecision, DispatchError> {
        let decision = self
            .store
            .hit(key, &self.policy, self.clock.now())
            .await
            .map_err(unavailable(GuardKind::RateLimiter))?;
        if !decision.allowed {
            tracing::info!(key, count = decision.count, limit = decision.limit, "rate limit exceeded");
        }
        Ok(decision.into_result()?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::clock::FakeClock;
    use crate::store::InMemoryGuardStore;

    #[tokio::test]
    async fn budget_resets_with_the_window() {
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let limiter = RateLimiter::new(
            Arc::new(InMemoryGuardStore::new()),
            RateLimitPolicy::new(2, 60).unwrap(),
            Arc::new(clock.clone()),
        );

        assert!(limiter.check("user:a").await.is_ok());
        assert!(limiter.check("user:a").await.is_ok());
        let err = limiter.check("user:a").await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(err.context()["retry_after_secs"], 60);

        // Keys are independent.
        assert!(limiter.check("user:b").await.is_ok());

        clock.advance(Duration::seconds(60));
        assert!(limiter.check("user:a").await.is_ok());
    }
}
