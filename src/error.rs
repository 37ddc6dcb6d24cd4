//! Error types for netquota.
//!
//! Two families live here. [`NetquotaError`] covers everything that goes wrong
//! while loading configuration or administering the registry. [`Rejection`] is
//! the outcome of an admission check that denies a request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::{NetworkKey, ObjectInfo, Rate, TimeUnit};

/// Main error type for configuration and registry operations.
#[derive(Error, Debug)]
pub enum NetquotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An object with the same type and name is already registered
    #[error("Object already exists: {0}")]
    ObjectExists(ObjectInfo),

    /// The object is not registered
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectInfo),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for NetquotaError {
    fn from(err: config::ConfigError) -> Self {
        NetquotaError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for NetquotaError {
    fn from(err: serde_yaml::Error) -> Self {
        NetquotaError::Config(err.to_string())
    }
}

/// Result type alias for netquota operations.
pub type Result<T> = std::result::Result<T, NetquotaError>;

/// Why a request was denied.
///
/// Rejections are authoritative: the host pipeline must deny the request.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// No rule covers the client address and there is no from-any rule.
    #[error("From IP address not allowed `{from}`; object:`{object}` ({cid})")]
    AddressNotPermitted {
        object: ObjectInfo,
        from: String,
        cid: String,
    },

    /// The client address could not be parsed.
    #[error("Invalid client address `{from}`; object:`{object}` ({cid})")]
    InvalidAddress {
        object: ObjectInfo,
        from: String,
        cid: String,
    },

    /// The matched rule's ceiling is already reached in the current period.
    #[error("{0}")]
    RateLimitExceeded(Box<LimitExceeded>),

    /// A parent object rejected the request.
    #[error("Parent `{parent}` rejected request: {source}")]
    ParentRejected {
        parent: ObjectInfo,
        source: Box<Rejection>,
    },

    /// No limiter is registered for the object.
    #[error("No rate limiting configured for `{object}` ({cid})")]
    ObjectNotFound { object: ObjectInfo, cid: String },
}

impl Rejection {
    /// The innermost rejection, skipping any `ParentRejected` wrappers.
    pub fn root_cause(&self) -> &Rejection {
        match self {
            Rejection::ParentRejected { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether this rejection, or its root cause, is a rate limit breach.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.root_cause(), Rejection::RateLimitExceeded(_))
    }
}

/// Diagnostics attached to a [`Rejection::RateLimitExceeded`].
///
/// The `last_*` fields describe the previous admitted request for the same
/// network in the same period of the same object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitExceeded {
    pub object: ObjectInfo,
    pub rate: Rate,
    pub unit: TimeUnit,
    pub from: String,
    pub network: NetworkKey,
    pub cid: String,
    pub last_from: Option<String>,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_cid: Option<String>,
}

impl std::fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Max. rate limit of {}/{} reached; object:`{}`, from:`{}`, network:`{}`; \
             last_from:`{}`; last_request_time_utc:`{}`; last_cid:`{}`; ({})",
            self.rate,
            self.unit,
            self.object,
            self.from,
            self.network,
            self.last_from.as_deref().unwrap_or("-"),
            self.last_request_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            self.last_cid.as_deref().unwrap_or("-"),
            self.cid,
        )
    }
}
