//! Queue configuration keys stored alongside the jobs.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::retry::{DEFAULT_BACKOFF_BASE, RetryPolicy};

/// Default `max_retries` for jobs enqueued without an explicit value.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Reserved key holding the latest cross-process worker stop request.
///
/// Not a [`ConfigKey`]: users cannot write it through `set_config`.
pub const WORKER_STOP_KEY: &str = "worker_stop_requested_at";

/// A configuration key the queue understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 2] = [ConfigKey::MaxRetries, ConfigKey::BackoffBase];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
        }
    }

    /// Value seeded on first initialization.
    pub fn default_value(&self) -> u32 {
        match self {
            ConfigKey::MaxRetries => DEFAULT_MAX_RETRIES,
            ConfigKey::BackoffBase => DEFAULT_BACKOFF_BASE,
        }
    }

    /// `(key, value)` pairs seeded into an empty store.
    pub fn defaults() -> impl Iterator<Item = (&'static str, String)> {
        Self::ALL
            .into_iter()
            .map(|k| (k.as_str(), k.default_value().to_string()))
    }

    /// Parse a raw stored value. Both keys are integers `>= 1`.
    pub fn parse_value(&self, raw: &str) -> DomainResult<u32> {
        let value: u32 = raw.trim().parse().map_err(|_| {
            DomainError::validation(format!(
                "{} must be a positive integer, got '{raw}'",
                self.as_str()
            ))
        })?;
        if value == 0 {
            return Err(DomainError::validation(format!(
                "{} must be at least 1",
                self.as_str()
            )));
        }
        Ok(value)
    }
}

impl core::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "max_retries" | "max-retries" => Ok(ConfigKey::MaxRetries),
            "backoff_base" | "backoff-base" => Ok(ConfigKey::BackoffBase),
            other => Err(DomainError::unknown_config_key(other)),
        }
    }
}

/// Effective queue settings resolved from the config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base)
    }

    pub fn with(mut self, key: ConfigKey, value: u32) -> Self {
        match key {
            ConfigKey::MaxRetries => self.max_retries = value,
            ConfigKey::BackoffBase => self.backoff_base = value,
        }
        self
    }
}
