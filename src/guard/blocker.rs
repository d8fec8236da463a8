//! Violation tracking and escalating IP blocks.
//!
//! Everything lives in the key-value store with a TTL, so blocks and
//! violation windows expire on their own. Reads on the request path fail
//! open; the operator commands report store failures.

use super::Whitelist;
use crate::clock::{Clock, millis_to_datetime};
use crate::error::MarketError;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const BLOCK_PREFIX: &str = "guard:blocked:";
const VIOLATION_PREFIX: &str = "guard:violations:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscalationPolicy {
    /// Violations inside one window before the first block.
    pub threshold: u64,
    pub base_secs: u64,
    pub multiplier: u64,
    pub max_secs: u64,
    pub violation_window_secs: u64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            base_secs: 15 * 60,
            multiplier: 2,
            max_secs: 24 * 60 * 60,
            violation_window_secs: 60 * 60,
        }
    }
}

impl EscalationPolicy {
    /// Every two violations past the threshold raise the level by one.
    pub fn level(&self, count: u64) -> Option<u32> {
        if count < self.threshold {
            return None;
        }
        let level = (count - self.threshold) / 2 + 1;
        Some(u32::try_from(level).unwrap_or(u32::MAX))
    }

    pub fn block_duration(&self, count: u64) -> Option<u64> {
        let level = self.level(count)?;
        let factor = self.multiplier.saturating_pow(level - 1);
        Some(self.base_secs.saturating_mul(factor).min(self.max_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRecord {
    pub identifier: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub violation_count: u64,
    pub reason: String,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ViolationRecord {
    pub identifier: String,
    pub count: u64,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockStatus {
    pub identifier: String,
    pub whitelisted: bool,
    pub block: Option<BlockRecord>,
    pub remaining_secs: Option<u64>,
    pub violations: Option<ViolationRecord>,
}

#[derive(Clone)]
pub struct Blocker {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    policy: EscalationPolicy,
    whitelist: Whitelist,
}

fn block_key(identifier: &str) -> String {
    format!("{BLOCK_PREFIX}{identifier}")
}

fn violation_keys(identifier: &str) -> [String; 3] {
    [
        format!("{VIOLATION_PREFIX}{identifier}:count"),
        format!("{VIOLATION_PREFIX}{identifier}:endpoints"),
        format!("{VIOLATION_PREFIX}{identifier}:last"),
    ]
}

impl Blocker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        policy: EscalationPolicy,
        whitelist: Whitelist,
    ) -> Self {
        Self {
            kv,
            clock,
            policy,
            whitelist,
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub async fn is_blocked(&self, identifier: &str) -> bool {
        if self.whitelist.contains(identifier) {
            return false;
        }
        match self.kv.exists(&block_key(identifier)).await {
            Ok(blocked) => blocked,
            Err(err) => {
                warn!(target = "sokoni.guard", identifier, error = %err, "block_check_failed_open");
                false
            }
        }
    }

    /// Seconds until the identifier's block lapses.
    pub async fn remaining_secs(&self, identifier: &str) -> Option<u64> {
        let key = block_key(identifier);
        if let Ok(Some(secs)) = self.kv.ttl(&key).await {
            return Some(secs);
        }
        let record = self.read_block(&key).await.ok().flatten()?;
        self.secs_until(record.expires_at)
    }

    /// Whole seconds from now to `deadline`, rounded up; `None` once passed.
    fn secs_until(&self, deadline: DateTime<Utc>) -> Option<u64> {
        let deadline_ms = u64::try_from(deadline.timestamp_millis()).ok()?;
        let now = self.clock.now_millis();
        (deadline_ms > now).then(|| (deadline_ms - now).div_ceil(1000))
    }

    /// Counts one violation and blocks once the count crosses the policy
    /// threshold. Returns the block written, if any.
    pub async fn record_violation(&self, identifier: &str, endpoint: &str) -> Option<BlockRecord> {
        if self.whitelist.contains(identifier) {
            return None;
        }
        let window = self.policy.violation_window_secs;
        let [count_key, endpoints_key, last_key] = violation_keys(identifier);

        let count = match self.kv.incr_with_ttl(&count_key, window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(target = "sokoni.guard", identifier, error = %err, "violation_record_failed_open");
                return None;
            }
        };
        if let Err(err) = self.kv.add_to_set(&endpoints_key, endpoint, window).await {
            warn!(target = "sokoni.guard", identifier, error = %err, "violation_endpoint_not_saved");
        }
        let now_ms = self.clock.now_millis().to_string();
        if let Err(err) = self.kv.set_with_ttl(&last_key, &now_ms, window).await {
            warn!(target = "sokoni.guard", identifier, error = %err, "violation_timestamp_not_saved");
        }

        let duration = self.policy.block_duration(count)?;
        let reason = format!("{count} rate limit violations within {window}s");
        match self.write_block(identifier, duration, reason, count, false).await {
            Ok(record) => {
                crate::metrics::blocked(identifier, duration);
                info!(
                    target = "sokoni.guard",
                    identifier,
                    count,
                    duration_secs = duration,
                    "identifier_blocked"
                );
                Some(record)
            }
            Err(err) => {
                warn!(target = "sokoni.guard", identifier, error = %err, "block_write_failed_open");
                None
            }
        }
    }

    /// Operator block with an explicit duration. Skips the violation count.
    pub async fn block(
        &self,
        identifier: &str,
        duration_secs: u64,
        reason: &str,
    ) -> Result<BlockRecord, MarketError> {
        const OP: &str = "block";
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(MarketError::invalid_input(OP, "identifier is required"));
        }
        if duration_secs == 0 {
            return Err(MarketError::invalid_input(OP, "duration must be at least one second"));
        }
        if self.whitelist.contains(identifier) {
            return Err(MarketError::conflict(OP, "identifier is whitelisted"));
        }
        let count = self
            .violation_count(identifier)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        let record = self
            .write_block(identifier, duration_secs, reason.trim().to_string(), count, true)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        info!(target = "sokoni.guard", identifier, duration_secs, "identifier_blocked_manually");
        Ok(record)
    }

    /// Lifts a block and forgets the identifier's violations. Returns
    /// whether a block was in place.
    pub async fn unblock(&self, identifier: &str) -> Result<bool, MarketError> {
        const OP: &str = "unblock";
        let key = block_key(identifier);
        let existed = self
            .kv
            .exists(&key)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        let mut keys = violation_keys(identifier).to_vec();
        keys.push(key);
        self.kv
            .delete(&keys)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        info!(target = "sokoni.guard", identifier, existed, "identifier_unblocked");
        Ok(existed)
    }

    pub async fn clear_violations(&self, identifier: &str) -> Result<(), MarketError> {
        self.kv
            .delete(&violation_keys(identifier))
            .await
            .map_err(|err| MarketError::from_kv("clear_violations", err))
    }

    pub async fn status(&self, identifier: &str) -> Result<BlockStatus, MarketError> {
        const OP: &str = "block_status";
        let block = self
            .read_block(&block_key(identifier))
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        let remaining_secs = match &block {
            Some(record) => self
                .kv
                .ttl(&block_key(identifier))
                .await
                .map_err(|err| MarketError::from_kv(OP, err))?
                .or_else(|| self.secs_until(record.expires_at)),
            None => None,
        };
        let violations = self
            .violations(identifier)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        Ok(BlockStatus {
            identifier: identifier.to_string(),
            whitelisted: self.whitelist.contains(identifier),
            block,
            remaining_secs,
            violations,
        })
    }

    pub async fn list_blocked(&self) -> Result<Vec<BlockRecord>, MarketError> {
        const OP: &str = "list_blocked";
        let keys = self
            .kv
            .keys_with_prefix(BLOCK_PREFIX)
            .await
            .map_err(|err| MarketError::from_kv(OP, err))?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can expire between the scan and the read.
            if let Some(record) = self
                .read_block(&key)
                .await
                .map_err(|err| MarketError::from_kv(OP, err))?
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.identifier.cmp(&b.identifier)));
        Ok(records)
    }

    async fn write_block(
        &self,
        identifier: &str,
        duration_secs: u64,
        reason: String,
        violation_count: u64,
        manual: bool,
    ) -> Result<BlockRecord, crate::kv::KvError> {
        let now = self.clock.now_millis();
        let record = BlockRecord {
            identifier: identifier.to_string(),
            blocked_at: millis_to_datetime(now),
            expires_at: millis_to_datetime(now.saturating_add(duration_secs.saturating_mul(1000))),
            violation_count,
            reason,
            manual,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| crate::kv::KvError::Command(err.to_string()))?;
        self.kv
            .set_with_ttl(&block_key(identifier), &payload, duration_secs)
            .await?;
        Ok(record)
    }

    async fn read_block(&self, key: &str) -> Result<Option<BlockRecord>, crate::kv::KvError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(target = "sokoni.guard", key, error = %err, "unreadable_block_record");
                Ok(None)
            }
        }
    }

    async fn violation_count(&self, identifier: &str) -> Result<u64, crate::kv::KvError> {
        let [count_key, _, _] = violation_keys(identifier);
        Ok(self
            .kv
            .get(&count_key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn violations(&self, identifier: &str) -> Result<Option<ViolationRecord>, crate::kv::KvError> {
        let [_, endpoints_key, last_key] = violation_keys(identifier);
        let count = self.violation_count(identifier).await?;
        if count == 0 {
            return Ok(None);
        }
        let mut endpoints = self.kv.set_members(&endpoints_key).await?;
        endpoints.sort();
        let last_violation_at = self
            .kv
            .get(&last_key)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(millis_to_datetime);
        Ok(Some(ViolationRecord {
            identifier: identifier.to_string(),
            count,
            last_violation_at,
            endpoints,
        }))
    }
}
