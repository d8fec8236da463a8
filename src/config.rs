//! Runtime configuration: optional YAML file, then environment overrides.

use crate::bulk::BulkConfig;
use crate::guard::GuardConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub redis_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub guard: GuardConfig,
    pub bulk: BulkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            redis_url: None,
            notify_webhook_url: None,
            http_timeout_secs: 15,
            http_connect_timeout_secs: 5,
            guard: GuardConfig::default(),
            bulk: BulkConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `SOKONI_CONFIG` if set, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SOKONI_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str| text(key).and_then(|v| parse::<u64>(&v));
        let ratio = |key: &str| text(key).and_then(|v| parse::<f64>(&v));

        if let Some(port) = text("PORT").and_then(|v| parse::<u16>(&v)) {
            self.port = port;
        }
        if let Some(url) = text("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(url) = text("NOTIFY_WEBHOOK_URL") {
            self.notify_webhook_url = Some(url);
        }
        if let Some(secs) = parsed("HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs;
        }
        if let Some(secs) = parsed("HTTP_CONNECT_TIMEOUT_SECS") {
            self.http_connect_timeout_secs = secs;
        }

        let guard = &mut self.guard;
        if let Some(max) = parsed("RATE_LIMIT_MAX") {
            guard.global.max = max;
        }
        if let Some(secs) = parsed("RATE_LIMIT_WINDOW_SECS") {
            guard.global.window_secs = secs;
        }
        if let Some(max) = parsed("UPLOAD_RATE_LIMIT_MAX") {
            guard.uploads.max = max;
        }
        if let Some(threshold) = parsed("BLOCK_THRESHOLD") {
            guard.escalation.threshold = threshold;
        }
        if let Some(secs) = parsed("BLOCK_BASE_SECS") {
            guard.escalation.base_secs = secs;
        }
        if let Some(secs) = parsed("BLOCK_MAX_SECS") {
            guard.escalation.max_secs = secs;
        }
        if let Some(multiplier) = parsed("BLOCK_MULTIPLIER") {
            guard.escalation.multiplier = multiplier;
        }
        if let Some(secs) = parsed("VIOLATION_WINDOW_SECS") {
            guard.escalation.violation_window_secs = secs;
        }
        if let Some(list) = text("GUARD_WHITELIST") {
            guard.whitelist = list
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(list) = text("TRUSTED_PROXIES") {
            guard.trusted_proxies = list
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
        }

        let bulk = &mut self.bulk;
        if let Some(rows) = parsed("UPLOAD_MAX_ROWS") {
            bulk.limits.max_rows = rows as usize;
        }
        if let Some(bytes) = parsed("UPLOAD_MAX_BYTES") {
            bulk.limits.max_bytes = bytes as usize;
        }
        if let Some(value) = ratio("MATCH_MIN_SIMILARITY") {
            bulk.matcher.min_similarity = value;
        }
        if let Some(value) = ratio("MATCH_HIGH_CONFIDENCE") {
            bulk.matcher.high_confidence = value;
        }
        if let Some(value) = ratio("MATCH_AMBIGUITY_MARGIN") {
            bulk.matcher.ambiguity_margin = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(message.to_string()))
        };
        let matcher = &self.bulk.matcher;
        let unit = 0.0..=1.0;
        if !unit.contains(&matcher.min_similarity)
            || !unit.contains(&matcher.high_confidence)
            || !unit.contains(&matcher.ambiguity_margin)
        {
            return invalid("matcher thresholds must lie in [0, 1]");
        }
        if matcher.min_similarity > matcher.high_confidence {
            return invalid("min_similarity cannot exceed high_confidence");
        }
        if self.bulk.limits.max_rows == 0 || self.bulk.limits.max_bytes == 0 {
            return invalid("upload limits must be positive");
        }
        for limit in [self.guard.global, self.guard.uploads] {
            if limit.max == 0 || limit.window_secs == 0 {
                return invalid("rate limits need a positive max and window");
            }
        }
        let escalation = &self.guard.escalation;
        if escalation.threshold == 0
            || escalation.base_secs == 0
            || escalation.multiplier == 0
            || escalation.violation_window_secs == 0
        {
            return invalid("escalation settings must be positive");
        }
        if escalation.max_secs < escalation.base_secs {
            return invalid("block max_secs cannot be below base_secs");
        }
        if let Some(bad) = self
            .guard
            .trusted_proxies
            .iter()
            .find(|entry| entry.trim().parse::<IpAddr>().is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "trusted proxy `{bad}` is not an IP address"
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}
