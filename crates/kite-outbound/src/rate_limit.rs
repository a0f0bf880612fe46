use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kite_core::{duration_to_chrono, Clock, SystemClock};

/// Verdict for one attempted use of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// `retry_after` never exceeds the window length.
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Counter seam so a shared backend can replace the process-local one.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Records one use of `key` if fewer than `limit` uses fall inside the trailing `window`.
    async fn check_and_increment(&self, key: &str, limit: u32, window: Duration) -> RateDecision;
}

/// Process-local sliding-log limiter.
///
/// Counters live in this process only; deployments running several instances
/// need a shared [`RateLimiter`] instead.
pub struct SlidingWindowRateLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SlidingWindowRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn decide(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let now = self.clock.now();
        let span = duration_to_chrono(window);
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let hits = windows.entry(key.to_string()).or_default();
        while hits.front().is_some_and(|oldest| expiry(*oldest, span) <= now) {
            hits.pop_front();
        }

        let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        if used < limit {
            hits.push_back(now);
            return RateDecision::Allowed {
                remaining: limit - used - 1,
            };
        }
        let retry_after = hits
            .front()
            .map(|oldest| (expiry(*oldest, span) - now).to_std().unwrap_or_default())
            .unwrap_or(window)
            .min(window);
        RateDecision::Denied { retry_after }
    }
}

fn expiry(hit: DateTime<Utc>, span: chrono::Duration) -> DateTime<Utc> {
    hit.checked_add_signed(span)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check_and_increment(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        self.decide(key, limit, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kite_core::ManualClock;
    use proptest::prelude::*;

    fn limiter() -> (SlidingWindowRateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap());
        (SlidingWindowRateLimiter::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn unit_limiter_denies_after_limit_and_recovers_when_window_slides() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(60);
        for expected_remaining in (0..3).rev() {
            assert_eq!(
                limiter.check_and_increment("acme", 3, window).await,
                RateDecision::Allowed {
                    remaining: expected_remaining
                }
            );
            clock.advance(chrono::Duration::seconds(10));
        }

        // First hit was 30s ago, so it expires in 30s.
        assert_eq!(
            limiter.check_and_increment("acme", 3, window).await,
            RateDecision::Denied {
                retry_after: Duration::from_secs(30)
            }
        );
        assert!(limiter
            .check_and_increment("globex", 3, window)
            .await
            .is_allowed());

        clock.advance(chrono::Duration::seconds(30));
        assert!(limiter.check_and_increment("acme", 3, window).await.is_allowed());
    }

    #[tokio::test]
    async fn unit_zero_limit_always_denies_with_full_window() {
        let (limiter, _) = limiter();
        assert_eq!(
            limiter
                .check_and_increment("acme", 0, Duration::from_secs(60))
                .await,
            RateDecision::Denied {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    proptest! {
        #[test]
        fn property_limiter_never_admits_more_than_limit_per_window(
            limit in 1_u32..8,
            window_secs in 1_u64..120,
            steps in proptest::collection::vec(0_i64..30, 1..60),
        ) {
            let (limiter, clock) = limiter();
            let window = Duration::from_secs(window_secs);
            let mut admitted: Vec<DateTime<Utc>> = Vec::new();
            for step in steps {
                clock.advance(chrono::Duration::seconds(step));
                let now = clock.now();
                match limiter.decide("k", limit, window) {
                    RateDecision::Allowed { .. } => admitted.push(now),
                    RateDecision::Denied { retry_after } => prop_assert!(retry_after <= window),
                }
                let span = duration_to_chrono(window);
                let in_window = admitted.iter().filter(|at| **at + span > now).count();
                prop_assert!(in_window <= limit as usize);
            }
        }
    }
}
