//! Decides which state transitions are worth an alert
//!
//! The policy is a pure function of the transition. Rate limiting is
//! applied by the caller through the tracker's cooldown gate.

use crate::models::{HealthState, SourceKind, TransitionEvent};
use serde::{Deserialize, Serialize};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of evaluating a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    None,
    Notify(AlertSeverity),
}

impl AlertDecision {
    pub fn severity(&self) -> Option<AlertSeverity> {
        match self {
            AlertDecision::None => None,
            AlertDecision::Notify(severity) => Some(*severity),
        }
    }
}

/// Transition rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    /// Pods reporting phase Unknown are treated as critical
    unknown_is_critical: bool,
}

impl AlertPolicy {
    pub fn new(unknown_is_critical: bool) -> Self {
        Self {
            unknown_is_critical,
        }
    }

    /// Rule set for the given source; streaming sources alert on Unknown
    pub fn for_source(kind: SourceKind) -> Self {
        Self::new(kind.is_streaming())
    }

    /// States that raise a critical alert when entered
    pub fn is_critical(&self, state: HealthState) -> bool {
        match state {
            HealthState::Unhealthy | HealthState::Failed => true,
            HealthState::Unknown => self.unknown_is_critical,
            _ => false,
        }
    }

    pub fn decide(&self, event: &TransitionEvent) -> AlertDecision {
        if self.is_critical(event.to) {
            return AlertDecision::Notify(AlertSeverity::Critical);
        }

        match (event.from, event.to) {
            (_, HealthState::Deleted) => AlertDecision::Notify(AlertSeverity::Info),
            (Some(from), HealthState::Running) if self.is_critical(from) => {
                AlertDecision::Notify(AlertSeverity::Info)
            }
            _ => AlertDecision::None,
        }
    }
}
