//! Engine error taxonomy. Every failure is scoped to one cluster identity.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Needs a user correction; never retried for the same generation.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("transient platform error: {0}")]
    TransientPlatform(String),
    #[error("permission denied: {0}")]
    Permission(String),
    /// Stale revision on update. The next attempt re-reads live state and re-plans.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rolling update of {role} stalled at member {member}: {reason}")]
    RollingUpdateStalled { role: String, member: u32, reason: String },
    /// Restarting the member would leave the role without quorum; the coordinator fails closed.
    #[error("refusing to restart {role} member {member}: {reason}")]
    QuorumRisk { role: String, member: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryClass {
    /// Stop retrying until a new spec generation is observed.
    Fatal,
    /// Retry after exponential backoff.
    Backoff,
    /// Retry right away from a fresh read.
    Immediate,
}

impl Error {
    pub fn invalid_spec(msg: impl Into<String>) -> Self { Self::InvalidSpec(msg.into()) }
    pub fn transient(msg: impl Into<String>) -> Self { Self::TransientPlatform(msg.into()) }
    pub fn permission(msg: impl Into<String>) -> Self { Self::Permission(msg.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Error::InvalidSpec(_) | Error::Permission(_) => RetryClass::Fatal,
            Error::Conflict(_) => RetryClass::Immediate,
            Error::TransientPlatform(_) | Error::RollingUpdateStalled { .. } | Error::QuorumRisk { .. } => RetryClass::Backoff,
        }
    }

    /// Short machine-readable reason used for status conditions and events.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::TransientPlatform(_) => "TransientPlatformError",
            Error::Permission(_) => "PermissionError",
            Error::Conflict(_) => "ConflictError",
            Error::RollingUpdateStalled { .. } => "RollingUpdateStalled",
            Error::QuorumRisk { .. } => "QuorumRisk",
        }
    }

    fn severity(&self) -> u8 {
        match self.retry_class() {
            RetryClass::Fatal => 2,
            RetryClass::Backoff => 1,
            RetryClass::Immediate => 0,
        }
    }

    /// Fold several object-level failures into the one that decides the cycle outcome:
    /// fatal beats backoff beats immediate; the first of equal severity wins.
    pub fn worst(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        errors.into_iter().fold(None, |acc: Option<Error>, e| match acc {
            Some(a) if a.severity() >= e.severity() => Some(a),
            _ => Some(e),
        })
    }
}
