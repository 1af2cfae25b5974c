//! Core data models for workload health tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length Docker container IDs are truncated to
pub const SHORT_ID_LEN: usize = 12;

/// Stable key for a tracked workload
///
/// A truncated container ID for Docker, `namespace/name` for pods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadIdentity(String);

impl WorkloadIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity for a Docker container, truncated to the short ID form
    pub fn container(container_id: &str) -> Self {
        let short: String = container_id.chars().take(SHORT_ID_LEN).collect();
        Self(short)
    }

    /// Identity for a Kubernetes pod
    pub fn pod(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized health/lifecycle state of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Running,
    Stopped,
    Unhealthy,
    Failed,
    /// Pod accepted by the cluster but not yet running
    Pending,
    Unknown,
    Deleted,
}

impl HealthState {
    /// Sentinel gauge value for states outside running/stopped/unhealthy
    pub const OTHER_GAUGE_VALUE: f64 = -2.0;

    /// Numeric encoding used by the status gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthState::Running => 1.0,
            HealthState::Stopped => 0.0,
            HealthState::Unhealthy => -1.0,
            _ => Self::OTHER_GAUGE_VALUE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Running => "running",
            HealthState::Stopped => "stopped",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Failed => "failed",
            HealthState::Pending => "pending",
            HealthState::Unknown => "unknown",
            HealthState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(HealthState::Running),
            "stopped" => Ok(HealthState::Stopped),
            "unhealthy" => Ok(HealthState::Unhealthy),
            "failed" => Ok(HealthState::Failed),
            "pending" => Ok(HealthState::Pending),
            "unknown" => Ok(HealthState::Unknown),
            "deleted" => Ok(HealthState::Deleted),
            other => Err(format!("unknown health state: {}", other)),
        }
    }
}

/// Which kind of source produced the records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Docker,
    Kubernetes,
}

impl SourceKind {
    /// Streaming sources push events instead of being polled
    pub fn is_streaming(&self) -> bool {
        matches!(self, SourceKind::Kubernetes)
    }

    /// Noun used in alert text
    pub fn workload_noun(&self) -> &'static str {
        match self {
            SourceKind::Docker => "docker container",
            SourceKind::Kubernetes => "pod",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Docker => write!(f, "docker"),
            SourceKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Source-specific labels attached to a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadLabels {
    /// Host name (Docker) or namespace (Kubernetes)
    pub scope: String,
    /// Human readable workload name
    pub name: String,
}

impl WorkloadLabels {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

/// A single normalized observation produced by a source adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRecord {
    pub identity: WorkloadIdentity,
    pub state: HealthState,
    pub observed_at: DateTime<Utc>,
    pub labels: WorkloadLabels,
}

impl ObservedRecord {
    pub fn new(
        identity: WorkloadIdentity,
        state: HealthState,
        observed_at: DateTime<Utc>,
        labels: WorkloadLabels,
    ) -> Self {
        Self {
            identity,
            state,
            observed_at,
            labels,
        }
    }
}

/// Per-workload state owned by the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntry {
    pub identity: WorkloadIdentity,
    pub labels: WorkloadLabels,
    pub current_state: HealthState,
    pub previous_state: Option<HealthState>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub last_alert_sent_at: Option<DateTime<Utc>>,
    /// Set while the workload is missing from full enumerations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<DateTime<Utc>>,
}

/// A change in a workload's health state between two observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub identity: WorkloadIdentity,
    pub labels: WorkloadLabels,
    /// `None` on the first observation of the workload
    pub from: Option<HealthState>,
    pub to: HealthState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_identity_truncation() {
        let id = WorkloadIdentity::container(
            "abc123def4567890abc123def4567890abc123def4567890abc123def4567890",
        );
        assert_eq!(id.as_str(), "abc123def456");

        let short = WorkloadIdentity::container("abc123");
        assert_eq!(short.as_str(), "abc123");
    }

    #[test]
    fn test_pod_identity() {
        let id = WorkloadIdentity::pod("kube-system", "coredns-abc");
        assert_eq!(id.to_string(), "kube-system/coredns-abc");
    }

    #[test]
    fn test_gauge_encoding() {
        assert_eq!(HealthState::Running.gauge_value(), 1.0);
        assert_eq!(HealthState::Stopped.gauge_value(), 0.0);
        assert_eq!(HealthState::Unhealthy.gauge_value(), -1.0);
        assert_eq!(HealthState::Unknown.gauge_value(), -2.0);
        assert_eq!(HealthState::Failed.gauge_value(), -2.0);
        assert_eq!(HealthState::Pending.gauge_value(), -2.0);
    }

    #[test]
    fn test_health_state_parse() {
        assert_eq!("Unhealthy".parse::<HealthState>(), Ok(HealthState::Unhealthy));
        assert!("sideways".parse::<HealthState>().is_err());
    }

    #[test]
    fn test_health_state_serializes_lowercase() {
        let json = serde_json::to_string(&HealthState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
