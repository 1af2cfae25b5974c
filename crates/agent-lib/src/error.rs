//! Failure taxonomy for sources, alert delivery and remediation

use crate::models::WorkloadIdentity;
use thiserror::Error;

/// Errors raised by workload source adapters
#[derive(Debug, Error)]
pub enum SourceError {
    /// Connection, auth or listing failure; retried with backoff
    #[error("workload source unavailable: {0}")]
    Unavailable(String),

    /// Detail lookup failed for a single workload; the workload is skipped
    #[error("failed to inspect workload {identity}: {reason}")]
    Inspect {
        identity: WorkloadIdentity,
        reason: String,
    },
}

impl SourceError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        SourceError::Unavailable(err.to_string())
    }

    pub fn inspect(identity: WorkloadIdentity, err: impl std::fmt::Display) -> Self {
        SourceError::Inspect {
            identity,
            reason: err.to_string(),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Unavailable(_) => "unavailable",
            SourceError::Inspect { .. } => "inspect",
        }
    }
}

/// The alert sink rejected or failed to receive a message
#[derive(Debug, Error)]
#[error("alert delivery via {sink} failed: {reason}")]
pub struct DeliveryFailed {
    pub sink: &'static str,
    pub reason: String,
}

impl DeliveryFailed {
    pub fn new(sink: &'static str, reason: impl Into<String>) -> Self {
        Self {
            sink,
            reason: reason.into(),
        }
    }
}

/// A restart request against the workload source failed
#[derive(Debug, Error)]
#[error("failed to restart {identity}: {reason}")]
pub struct RemediationFailed {
    pub identity: WorkloadIdentity,
    pub reason: String,
}

impl RemediationFailed {
    pub fn new(identity: WorkloadIdentity, reason: impl std::fmt::Display) -> Self {
        Self {
            identity,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        let err = SourceError::inspect(WorkloadIdentity::new("abc123"), "no such container");
        assert_eq!(
            err.to_string(),
            "failed to inspect workload abc123: no such container"
        );
        assert_eq!(err.kind(), "inspect");
        assert_eq!(SourceError::unavailable("refused").kind(), "unavailable");
    }
}
