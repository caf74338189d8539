//! Engine configuration.

use crate::middleware::SuppressPolicy;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the action timeout in milliseconds.
pub const ACTION_TIMEOUT_ENV: &str = "KUMIHIMO_ACTION_TIMEOUT_MS";
/// Environment variable holding the default suppress policy.
pub const SUPPRESS_POLICY_ENV: &str = "KUMIHIMO_SUPPRESS_POLICY";

const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by every step of a run.
///
/// Deserializes from a map with `action_timeout_ms` (`0` or `null`
/// disables the timeout) and `suppress_policy`.
///
/// # Examples
///
/// ```
/// use kumihimo::{EngineConfig, SuppressPolicy};
/// use std::time::Duration;
///
/// let config: EngineConfig =
///     serde_json::from_str(r#"{"action_timeout_ms": 1500, "suppress_policy": "keep"}"#).unwrap();
/// assert_eq!(config.action_timeout, Some(Duration::from_millis(1500)));
/// assert_eq!(config.suppress_policy, SuppressPolicy::Keep);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawEngineConfig")]
pub struct EngineConfig {
    /// Limit on every callable invocation.
    pub action_timeout: Option<Duration>,
    /// Policy of `suppress` fields that do not name one.
    pub suppress_policy: SuppressPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout: Some(DEFAULT_ACTION_TIMEOUT),
            suppress_policy: SuppressPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_suppress_policy(mut self, policy: SuppressPolicy) -> Self {
        self.suppress_policy = policy;
        self
    }

    /// Defaults overridden by `KUMIHIMO_ACTION_TIMEOUT_MS` and
    /// `KUMIHIMO_SUPPRESS_POLICY` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ACTION_TIMEOUT_ENV) {
            let millis = value.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                variable: ACTION_TIMEOUT_ENV,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            config.action_timeout = timeout_from_millis(Some(millis));
        }

        if let Some(value) = lookup(SUPPRESS_POLICY_ENV) {
            config.suppress_policy =
                value.trim().parse().map_err(|reason| ConfigError::InvalidValue {
                    variable: SUPPRESS_POLICY_ENV,
                    value: value.clone(),
                    reason,
                })?;
        }

        Ok(config)
    }
}

fn timeout_from_millis(millis: Option<u64>) -> Option<Duration> {
    millis.filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawEngineConfig {
    action_timeout_ms: Option<u64>,
    suppress_policy: SuppressPolicy,
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: Some(DEFAULT_ACTION_TIMEOUT.as_millis() as u64),
            suppress_policy: SuppressPolicy::default(),
        }
    }
}

impl From<RawEngineConfig> for EngineConfig {
    fn from(raw: RawEngineConfig) -> Self {
        Self {
            action_timeout: timeout_from_millis(raw.action_timeout_ms),
            suppress_policy: raw.suppress_policy,
        }
    }
}
