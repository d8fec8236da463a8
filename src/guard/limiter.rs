//! Fixed-window request counting.

use super::Whitelist;
use super::blocker::Blocker;
use crate::clock::Clock;
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Ip,
    Principal,
    PrincipalEndpoint,
}

/// Who is asking and for what.
#[derive(Debug, Clone, Copy)]
pub struct RateSubject<'a> {
    pub ip: &'a str,
    pub principal: Option<Uuid>,
    pub endpoint: &'a str,
}

pub type SkipPredicate = Arc<dyn Fn(&RateSubject<'_>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RateLimitPolicy {
    /// Also the counter key prefix.
    pub name: String,
    pub window_secs: u64,
    pub max: u64,
    pub strategy: KeyStrategy,
    pub skip: Option<SkipPredicate>,
    pub whitelist: Whitelist,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("name", &self.name)
            .field("window_secs", &self.window_secs)
            .field("max", &self.max)
            .field("strategy", &self.strategy)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, window_secs: u64, max: u64, strategy: KeyStrategy) -> Self {
        Self {
            name: name.into(),
            window_secs: window_secs.max(1),
            max: max.max(1),
            strategy,
            skip: None,
            whitelist: Whitelist::default(),
        }
    }

    pub fn with_skip(
        mut self,
        skip: impl Fn(&RateSubject<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip = Some(Arc::new(skip));
        self
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    /// Counter identity for a subject. Anonymous callers fall back to their
    /// IP under the principal strategies.
    pub fn identifier(&self, subject: &RateSubject<'_>) -> String {
        let who = subject
            .principal
            .map(|id| id.to_string())
            .unwrap_or_else(|| subject.ip.to_string());
        match self.strategy {
            KeyStrategy::Ip => subject.ip.to_string(),
            KeyStrategy::Principal => who,
            KeyStrategy::PrincipalEndpoint => format!("{who}:{}", subject.endpoint),
        }
    }

    fn exempt(&self, subject: &RateSubject<'_>) -> bool {
        self.whitelist.contains(subject.ip) || self.skip.as_ref().is_some_and(|skip| skip(subject))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window closes.
    pub reset_at: u64,
    /// Whole seconds to wait, set only on denial.
    pub retry_after: Option<u64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
    blocker: Option<Blocker>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, policy: RateLimitPolicy) -> Self {
        Self {
            kv,
            clock,
            policy,
            blocker: None,
        }
    }

    /// Denials are reported to `blocker` as violations.
    pub fn reporting_to(mut self, blocker: Blocker) -> Self {
        self.blocker = Some(blocker);
        self
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub async fn check(&self, subject: &RateSubject<'_>) -> RateDecision {
        let window_ms = self.policy.window_secs * 1000;
        let now_ms = self.clock.now_millis();
        let window_start_ms = now_ms / window_ms * window_ms;
        let reset_at_ms = window_start_ms + window_ms;
        let open = RateDecision {
            allowed: true,
            limit: self.policy.max,
            remaining: self.policy.max,
            reset_at: reset_at_ms / 1000,
            retry_after: None,
        };

        if self.policy.exempt(subject) {
            return open;
        }

        let identifier = self.policy.identifier(subject);
        let key = format!(
            "{}:{}:{}",
            self.policy.name,
            identifier,
            window_start_ms / 1000
        );
        let count = match self.kv.incr_with_ttl(&key, self.policy.window_secs).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "sokoni.guard",
                    policy = %self.policy.name,
                    error = %err,
                    "rate_limit_failed_open"
                );
                return open;
            }
        };

        if count <= self.policy.max {
            return RateDecision {
                remaining: self.policy.max - count,
                ..open
            };
        }

        let retry_after = (reset_at_ms - now_ms).div_ceil(1000).max(1);
        crate::metrics::rate_limited(&self.policy.name);
        debug!(
            target = "sokoni.guard",
            policy = %self.policy.name,
            identifier = %identifier,
            count,
            retry_after,
            "rate_limited"
        );
        if let Some(blocker) = &self.blocker {
            blocker.record_violation(subject.ip, subject.endpoint).await;
        }
        RateDecision {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
            ..open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::guard::blocker::EscalationPolicy;
    use crate::kv::MemoryKv;

    const IP: &str = "203.0.113.7";

    fn subject(endpoint: &str) -> RateSubject<'_> {
        RateSubject {
            ip: IP,
            principal: None,
            endpoint,
        }
    }

    fn limiter(clock: &ManualClock, kv: &MemoryKv, max: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(kv.clone()),
            Arc::new(clock.clone()),
            RateLimitPolicy::new("rl:test", 60, max, KeyStrategy::Ip),
        )
    }

    #[tokio::test]
    async fn request_reaching_max_is_allowed_and_next_is_denied() {
        let clock = ManualClock::default();
        clock.advance_millis(45_500);
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let limiter = limiter(&clock, &kv, 3);

        let first = limiter.check(&subject("/a")).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);
        limiter.check(&subject("/a")).await;
        let third = limiter.check(&subject("/a")).await;
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check(&subject("/a")).await;
        assert!(!fourth.allowed);
        assert_eq!(fourth.retry_after, Some(15));
        assert_eq!(fourth.reset_at, 1_704_067_200 + 60);
    }

    #[tokio::test]
    async fn counts_restart_in_the_next_window() {
        let clock = ManualClock::default();
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let limiter = limiter(&clock, &kv, 1);
        assert!(limiter.check(&subject("/a")).await.allowed);
        assert!(!limiter.check(&subject("/a")).await.allowed);
        clock.advance_secs(60);
        assert!(limiter.check(&subject("/a")).await.allowed);
    }

    #[tokio::test]
    async fn principal_endpoint_strategy_separates_counters() {
        let clock = ManualClock::default();
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let limiter = RateLimiter::new(
            Arc::new(kv.clone()),
            Arc::new(clock.clone()),
            RateLimitPolicy::new("rl:uploads", 60, 1, KeyStrategy::PrincipalEndpoint),
        );
        let user = Some(Uuid::from_u128(1));
        let upload = RateSubject {
            ip: IP,
            principal: user,
            endpoint: "upload",
        };
        let commit = RateSubject {
            endpoint: "commit",
            ..upload
        };
        assert!(limiter.check(&upload).await.allowed);
        assert!(limiter.check(&commit).await.allowed);
        assert!(!limiter.check(&upload).await.allowed);
        assert_eq!(
            limiter.policy().identifier(&upload),
            format!("{}:upload", Uuid::from_u128(1))
        );
    }

    #[tokio::test]
    async fn skip_predicate_and_whitelist_exempt_requests() {
        let clock = ManualClock::default();
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let policy = RateLimitPolicy::new("rl:test", 60, 1, KeyStrategy::Ip)
            .with_skip(|s| s.endpoint == "/health")
            .with_whitelist(Whitelist::from_entries(["127.0.0.1"]));
        let limiter = RateLimiter::new(Arc::new(kv.clone()), Arc::new(clock.clone()), policy);
        for _ in 0..3 {
            assert!(limiter.check(&subject("/health")).await.allowed);
            let local = RateSubject {
                ip: "127.0.0.1",
                principal: None,
                endpoint: "/a",
            };
            assert!(limiter.check(&local).await.allowed);
        }
    }

    #[tokio::test]
    async fn denials_feed_the_blocker() {
        let clock = ManualClock::default();
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let blocker = Blocker::new(
            Arc::new(kv.clone()),
            Arc::new(clock.clone()),
            EscalationPolicy::default(),
            Whitelist::default(),
        );
        let limiter = limiter(&clock, &kv, 1).reporting_to(blocker.clone());
        for _ in 0..4 {
            limiter.check(&subject("/a")).await;
        }
        assert!(blocker.is_blocked(IP).await);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let clock = ManualClock::default();
        let kv = MemoryKv::new(Arc::new(clock.clone()));
        let limiter = limiter(&clock, &kv, 1);
        kv.set_available(false);
        for _ in 0..5 {
            assert!(limiter.check(&subject("/a")).await.allowed);
        }
    }
}
