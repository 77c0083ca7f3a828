//! Error kinds shared across the monitor.
//!
//! The monitor recovers from almost everything: parse failures make a
//! container invisible, socket failures are retried on the next reconcile,
//! ACME failures wait for the next renewal tick. Only startup failures
//! (unreachable admin socket, unusable account-key directory, responder bind
//! failure) abort the process.

use std::time::Duration;

use thiserror::Error;

/// Why a container's labels did not parse into a deployment descriptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("missing required label '{0}'")]
    MissingField(&'static str),

    #[error("label 'turkis.acme.email' is not a valid email address: '{0}'")]
    InvalidEmail(String),

    #[error("no 'turkis.domain.<i>' labels present")]
    NoDomains,

    #[error("deployment id '{0}' is not a YYYYMMDDhhmmss timestamp")]
    BadTimestamp(String),

    #[error("invalid value for '{label}': '{value}'")]
    InvalidValue { label: String, value: String },
}

/// Failures talking to the HAProxy admin socket.
#[derive(Debug, Error)]
pub enum AdminSocketError {
    #[error("admin socket did not answer within {0:?}")]
    Timeout(Duration),

    #[error("HAProxy does not support '{command}'")]
    CommandUnsupported { command: String },

    #[error("HAProxy rejected '{command}': {response}")]
    CommandFailed { command: String, response: String },

    #[error("admin socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad classification of ACME failures, for logging and retry decisions.
/// Every kind is retried on the next renewal tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcmeError {
    #[error("rate limited by the ACME directory")]
    RateLimited,

    #[error("challenge validation failed: {0}")]
    ChallengeFailed(String),

    #[error("network error talking to the ACME directory: {0}")]
    Network(String),
}

impl AcmeError {
    /// Best-effort classification of an error chain coming out of the ACME
    /// client. The directory reports rate limits as a `rateLimited` problem
    /// type; everything that mentions an authorization or challenge is a
    /// validation failure; the rest is assumed transient.
    pub fn classify(err: &anyhow::Error) -> Self {
        let text = format!("{err:#}");
        if text.contains("rateLimited") || text.contains("too many") {
            AcmeError::RateLimited
        } else if text.contains("uthorization") || text.contains("hallenge") {
            AcmeError::ChallengeFailed(text)
        } else {
            AcmeError::Network(text)
        }
    }
}

/// A deployment advertised a host that an earlier deployment already owns.
/// The offending deployment is skipped during rendering; the owner keeps
/// serving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("domain '{host}' claimed by app '{claimant}' is already owned by app '{owner}'")]
pub struct DomainConflict {
    pub host: String,
    pub owner: String,
    pub claimant: String,
}
