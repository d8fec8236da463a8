//! Abuse protection in front of the API: fixed-window rate limits whose
//! denials escalate into temporary IP blocks.

pub mod blocker;
pub mod limiter;

pub use blocker::{BlockRecord, BlockStatus, Blocker, EscalationPolicy};
pub use limiter::{KeyStrategy, RateDecision, RateLimitPolicy, RateLimiter, RateSubject};

use crate::clock::Clock;
use crate::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

/// Identifiers that are never limited or blocked.
#[derive(Debug, Clone, Default)]
pub struct Whitelist(Arc<HashSet<String>>);

impl Whitelist {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(Arc::new(
            entries
                .into_iter()
                .map(|e| e.as_ref().trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        ))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.contains(identifier)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowLimit {
    pub max: u64,
    pub window_secs: u64,
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self {
            max: 100,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    /// Per-IP limit across the whole API.
    pub global: WindowLimit,
    /// Per-seller, per-operation limit on upload endpoints.
    pub uploads: WindowLimit,
    pub escalation: EscalationPolicy,
    pub whitelist: Vec<String>,
    /// Peers allowed to name the client through `X-Forwarded-For`.
    pub trusted_proxies: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            global: WindowLimit::default(),
            uploads: WindowLimit {
                max: 10,
                window_secs: 60,
            },
            escalation: EscalationPolicy::default(),
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            trusted_proxies: Vec::new(),
        }
    }
}

pub enum Verdict {
    Allowed(RateDecision),
    /// Whitelisted or exempt; no counters touched.
    Bypassed,
    Blocked { retry_after: Option<u64> },
    Limited(RateDecision),
}

#[derive(Clone)]
pub struct Guard {
    pub blocker: Blocker,
    pub global: RateLimiter,
    pub uploads: RateLimiter,
    whitelist: Whitelist,
    trusted_proxies: Arc<HashSet<IpAddr>>,
}

impl Guard {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
        let whitelist = Whitelist::from_entries(&config.whitelist);
        let blocker = Blocker::new(kv.clone(), clock.clone(), config.escalation, whitelist.clone());
        let global = RateLimiter::new(
            kv.clone(),
            clock.clone(),
            RateLimitPolicy::new("rl:global", config.global.window_secs, config.global.max, KeyStrategy::Ip)
                .with_skip(|subject| subject.endpoint == "/health")
                .with_whitelist(whitelist.clone()),
        )
        .reporting_to(blocker.clone());
        let uploads = RateLimiter::new(
            kv,
            clock,
            RateLimitPolicy::new(
                "rl:uploads",
                config.uploads.window_secs,
                config.uploads.max,
                KeyStrategy::PrincipalEndpoint,
            )
            .with_whitelist(whitelist.clone()),
        )
        .reporting_to(blocker.clone());
        let trusted_proxies = config
            .trusted_proxies
            .iter()
            .filter_map(|entry| entry.trim().parse().ok())
            .collect();
        Self {
            blocker,
            global,
            uploads,
            whitelist,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    /// Client address for a connection from `peer`. Forwarded hops are read
    /// right to left and only while each hop was appended by a trusted proxy.
    pub fn client_ip(&self, peer: Option<IpAddr>, forwarded_for: Option<&str>) -> String {
        let Some(peer) = peer else {
            return "unknown".to_string();
        };
        let mut client = peer;
        if let Some(chain) = forwarded_for {
            for hop in chain.rsplit(',') {
                if !self.trusted_proxies.contains(&client) {
                    break;
                }
                match hop.trim().parse::<IpAddr>() {
                    Ok(addr) => client = addr,
                    Err(_) => break,
                }
            }
        }
        client.to_string()
    }

    /// Blocker first, then the global window.
    pub async fn admit(&self, ip: &str, endpoint: &str) -> Verdict {
        if self.whitelist.contains(ip) {
            return Verdict::Bypassed;
        }
        if self.blocker.is_blocked(ip).await {
            crate::metrics::rejected_blocked(endpoint);
            return Verdict::Blocked {
                retry_after: self.blocker.remaining_secs(ip).await,
            };
        }
        let decision = self
            .global
            .check(&RateSubject {
                ip,
                principal: None,
                endpoint,
            })
            .await;
        if decision.allowed {
            Verdict::Allowed(decision)
        } else {
            Verdict::Limited(decision)
        }
    }
}
