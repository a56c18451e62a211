//! Error types for the graceful drain controller

use thiserror::Error;

/// A rejected configuration value.
///
/// Every variant names the ConfigMap key it was raised for, so operators can
/// fix the ConfigMap from the message alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("{key}: expected an integer number of seconds, got {value:?}")]
    NotAnInteger { key: &'static str, value: String },

    #[error("{key} must be non-negative, got: {value}")]
    Negative { key: &'static str, value: i64 },

    #[error("{key} must be positive, got: {value}")]
    NotPositive { key: &'static str, value: i64 },

    #[error("{key} must not exceed {max}, got: {value}")]
    AboveMaximum {
        key: &'static str,
        value: i64,
        max: i64,
    },

    #[error(
        "drainTimeoutSeconds ({drain_timeout}) must not be less than gracePeriodSeconds ({grace_period})"
    )]
    TimeoutBelowGracePeriod { drain_timeout: i64, grace_period: i64 },

    #[error("namespaceSelector: malformed JSON: {reason}")]
    MalformedSelector { reason: String },
}

impl ConfigValidationError {
    /// The ConfigMap key this error was raised for
    pub fn key(&self) -> &'static str {
        match self {
            Self::NotAnInteger { key, .. }
            | Self::Negative { key, .. }
            | Self::NotPositive { key, .. }
            | Self::AboveMaximum { key, .. } => key,
            Self::TimeoutBelowGracePeriod { .. } => "drainTimeoutSeconds",
            Self::MalformedSelector { .. } => "namespaceSelector",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Conflict writing {kind} {namespace}/{name}: object changed since it was read")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Traffic probe failed for pod {pod}: {message}")]
    TrafficProbe { pod: String, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is transient and worth a quick retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::Conflict { .. } | Error::Timeout { .. } => true,
            Error::TrafficProbe { .. } => true,
            Error::InvalidConfig(_) | Error::ConfigError(_) | Error::SerializationError(_) => {
                false
            }
        }
    }

    /// Whether the error is an optimistic-concurrency precondition failure
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::InvalidConfig(_) => "invalid_config",
            Error::ConfigError(_) => "config",
            Error::Conflict { .. } => "conflict",
            Error::Timeout { .. } => "timeout",
            Error::TrafficProbe { .. } => "traffic_probe",
            Error::SerializationError(_) => "serialization",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
