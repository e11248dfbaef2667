//! Admission control: fixed-window rate limiting per (identity, category).
//!
//! The limiter is the first gate in the hub's request path; nothing else
//! runs for a rejected caller. Every check increments the bucket whether or
//! not the request is allowed, so retry storms keep paying for their
//! rejections instead of resetting them.
//!
//! Buckets are sharded by key in a concurrent map, so unrelated identities
//! never contend. The limiter never fails: an empty identity degrades to the
//! anonymous bucket.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::RateLimitSettings;

/// Coarse operation classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    /// Authenticate, join, leave.
    SessionControl,
    /// Signal forwarding.
    Signal,
    /// Everything else (latency reports and future operations).
    Default,
}

impl EndpointCategory {
    /// Category name for logging and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::SessionControl => "session-control",
            EndpointCategory::Signal => "signal",
            EndpointCategory::Default => "default",
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Total budget for the window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Unix seconds at which the window resets.
    pub reset_at: u64,
}

/// One fixed counting window.
struct Bucket {
    count: u32,
    window_start: u64,
    last_activity: u64,
}

/// Fixed-window rate limiter keyed by (identity, category).
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<(String, EndpointCategory), Bucket>,
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimiter {
    /// Create a limiter with the given budgets.
    #[must_use]
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    /// Check and count a request. Rejected requests are counted too.
    pub fn check(&self, identity: &str, category: EndpointCategory) -> Decision {
        self.check_at(identity, category, unix_now())
    }

    /// Check with an injected clock. Window arithmetic is pure in `now`, so
    /// tests drive time explicitly instead of sleeping.
    pub fn check_at(&self, identity: &str, category: EndpointCategory, now: u64) -> Decision {
        let identity = if identity.is_empty() {
            "anonymous"
        } else {
            identity
        };
        let limit = self.limit_for(category);
        let window = self.settings.window.as_secs().max(1);

        let mut bucket = self
            .buckets
            .entry((identity.to_string(), category))
            .or_insert_with(|| Bucket {
                count: 0,
                window_start: now,
                last_activity: now,
            });

        // Window rollover: reset_at only ever moves forward because the new
        // start is at or past the old reset time.
        if now >= bucket.window_start.saturating_add(window) {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count = bucket.count.saturating_add(1);
        bucket.last_activity = now;

        Decision {
            allowed: bucket.count <= limit,
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_at: bucket.window_start.saturating_add(window),
        }
    }

    /// Drop buckets with no activity past the retention horizon.
    /// Returns the number of buckets evicted.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(unix_now())
    }

    /// Eviction with an injected clock.
    pub fn evict_idle_at(&self, now: u64) -> usize {
        let horizon = self.settings.retention.as_secs();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_activity) <= horizon);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn limit_for(&self, category: EndpointCategory) -> u32 {
        match category {
            EndpointCategory::SessionControl => self.settings.session_control_limit,
            EndpointCategory::Signal => self.settings.signal_limit,
            EndpointCategory::Default => self.settings.default_limit,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(window_secs),
            session_control_limit: limit,
            signal_limit: limit,
            default_limit: limit,
            retention: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_requests_within_budget_are_allowed() {
        let limiter = make_limiter(10, 60);

        for i in 0..10 {
            let decision = limiter.check_at("alice", EndpointCategory::Signal, 1_000);
            assert!(decision.allowed, "call {i} should be allowed");
            assert_eq!(decision.limit, 10);
        }

        let decision = limiter.check_at("alice", EndpointCategory::Signal, 1_000);
        assert!(!decision.allowed, "11th call should be rejected");
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, 1_060);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let limiter = make_limiter(2, 60);

        assert!(limiter.check_at("alice", EndpointCategory::Signal, 0).allowed);
        assert!(limiter.check_at("alice", EndpointCategory::Signal, 0).allowed);
        assert!(!limiter.check_at("alice", EndpointCategory::Signal, 59).allowed);

        // Fresh window, fresh budget, reset time moved forward.
        let decision = limiter.check_at("alice", EndpointCategory::Signal, 60);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, 120);
    }

    #[test]
    fn test_rejected_requests_still_count() {
        let limiter = make_limiter(2, 60);

        for _ in 0..5 {
            limiter.check_at("alice", EndpointCategory::Signal, 10);
        }

        let decision = limiter.check_at("alice", EndpointCategory::Signal, 10);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_categories_have_independent_budgets() {
        let limiter = RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(60),
            session_control_limit: 1,
            signal_limit: 3,
            default_limit: 2,
            retention: Duration::from_secs(300),
        });

        assert!(
            limiter
                .check_at("alice", EndpointCategory::SessionControl, 0)
                .allowed
        );
        assert!(
            !limiter
                .check_at("alice", EndpointCategory::SessionControl, 0)
                .allowed
        );

        // Signal budget is untouched by session-control spend.
        for _ in 0..3 {
            assert!(limiter.check_at("alice", EndpointCategory::Signal, 0).allowed);
        }
    }

    #[test]
    fn test_identities_do_not_share_buckets() {
        let limiter = make_limiter(1, 60);

        assert!(limiter.check_at("alice", EndpointCategory::Signal, 0).allowed);
        assert!(!limiter.check_at("alice", EndpointCategory::Signal, 0).allowed);
        assert!(limiter.check_at("bob", EndpointCategory::Signal, 0).allowed);
    }

    #[test]
    fn test_empty_identity_degrades_to_anonymous() {
        let limiter = make_limiter(1, 60);

        assert!(limiter.check_at("", EndpointCategory::Default, 0).allowed);
        // Same bucket as the explicit anonymous key.
        assert!(
            !limiter
                .check_at("anonymous", EndpointCategory::Default, 0)
                .allowed
        );
    }

    #[test]
    fn test_idle_buckets_are_evicted() {
        let limiter = make_limiter(10, 60);

        limiter.check_at("alice", EndpointCategory::Signal, 0);
        limiter.check_at("bob", EndpointCategory::Signal, 250);
        assert_eq!(limiter.bucket_count(), 2);

        // Retention horizon is 300s: alice is stale at t=350, bob is not.
        assert_eq!(limiter.evict_idle_at(350), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
