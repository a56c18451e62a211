//! Operating configuration for the drain controller
//!
//! The configuration lives in a ConfigMap whose `data` map is validated into
//! an immutable [`DrainConfig`]. It is resolved fresh on every reconcile so
//! that edits to the ConfigMap take effect on the next trigger.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigValidationError;

pub const GRACE_PERIOD_KEY: &str = "gracePeriodSeconds";
pub const DRAIN_TIMEOUT_KEY: &str = "drainTimeoutSeconds";
pub const NAMESPACE_SELECTOR_KEY: &str = "namespaceSelector";

pub const DEFAULT_GRACE_PERIOD_SECONDS: i64 = 30;
pub const DEFAULT_DRAIN_TIMEOUT_SECONDS: i64 = 300;

const MAX_GRACE_PERIOD_SECONDS: i64 = 3600;
const MAX_DRAIN_TIMEOUT_SECONDS: i64 = 7200;

/// Include/exclude namespace lists
///
/// `include: []` is kept distinct from an absent `include`: the former
/// matches no namespace at all.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

/// Validated drain configuration
///
/// Any value produced by [`parse_config`] satisfies
/// `drain_timeout_seconds >= grace_period_seconds`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainConfig {
    pub grace_period_seconds: i64,
    pub drain_timeout_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: DEFAULT_GRACE_PERIOD_SECONDS,
            drain_timeout_seconds: DEFAULT_DRAIN_TIMEOUT_SECONDS,
            namespace_selector: None,
        }
    }
}

impl DrainConfig {
    /// Minimum hold after deletion is requested
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.grace_period_seconds)
    }

    /// Maximum hold after deletion is requested
    pub fn drain_timeout(&self) -> Duration {
        Duration::seconds(self.drain_timeout_seconds)
    }
}

/// Parse and validate ConfigMap data into a [`DrainConfig`].
///
/// `None` (no ConfigMap, or a ConfigMap without data) yields the defaults.
/// Each recognized key is validated on its own and the first invalid key
/// rejects the whole configuration. Unrecognized keys are ignored.
pub fn parse_config(
    data: Option<&BTreeMap<String, String>>,
) -> Result<DrainConfig, ConfigValidationError> {
    let mut config = DrainConfig::default();

    let Some(data) = data else {
        return Ok(config);
    };

    if let Some(raw) = data.get(GRACE_PERIOD_KEY) {
        let grace_period = parse_seconds(GRACE_PERIOD_KEY, raw)?;
        if grace_period < 0 {
            return Err(ConfigValidationError::Negative {
                key: GRACE_PERIOD_KEY,
                value: grace_period,
            });
        }
        if grace_period > MAX_GRACE_PERIOD_SECONDS {
            return Err(ConfigValidationError::AboveMaximum {
                key: GRACE_PERIOD_KEY,
                value: grace_period,
                max: MAX_GRACE_PERIOD_SECONDS,
            });
        }
        config.grace_period_seconds = grace_period;
    }

    if let Some(raw) = data.get(DRAIN_TIMEOUT_KEY) {
        let drain_timeout = parse_seconds(DRAIN_TIMEOUT_KEY, raw)?;
        if drain_timeout <= 0 {
            return Err(ConfigValidationError::NotPositive {
                key: DRAIN_TIMEOUT_KEY,
                value: drain_timeout,
            });
        }
        if drain_timeout > MAX_DRAIN_TIMEOUT_SECONDS {
            return Err(ConfigValidationError::AboveMaximum {
                key: DRAIN_TIMEOUT_KEY,
                value: drain_timeout,
                max: MAX_DRAIN_TIMEOUT_SECONDS,
            });
        }
        config.drain_timeout_seconds = drain_timeout;
    }

    // Also catches a custom grace period above the default drain timeout.
    if config.drain_timeout_seconds < config.grace_period_seconds {
        return Err(ConfigValidationError::TimeoutBelowGracePeriod {
            drain_timeout: config.drain_timeout_seconds,
            grace_period: config.grace_period_seconds,
        });
    }

    if let Some(raw) = data.get(NAMESPACE_SELECTOR_KEY) {
        let selector: NamespaceSelector = serde_json::from_str(raw).map_err(|e| {
            ConfigValidationError::MalformedSelector {
                reason: e.to_string(),
            }
        })?;
        config.namespace_selector = Some(selector);
    }

    Ok(config)
}

fn parse_seconds(key: &'static str, raw: &str) -> Result<i64, ConfigValidationError> {
    raw.parse::<i64>()
        .map_err(|_| ConfigValidationError::NotAnInteger {
            key,
            value: raw.to_string(),
        })
}
