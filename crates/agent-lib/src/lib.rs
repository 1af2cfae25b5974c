//! Agent library for workload health monitoring
//!
//! This crate provides the core functionality for:
//! - Observing containers (Docker) and pods (Kubernetes)
//! - Detecting health state transitions
//! - Alerting with per-workload cooldown
//! - Exporting workload health as Prometheus gauges
//! - Optional restart-on-unhealthy remediation
//! - Health checks and observability of the agent itself

pub mod alert;
pub mod error;
pub mod exporter;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod remediation;
pub mod source;
pub mod tracker;

pub use error::{DeliveryFailed, RemediationFailed, SourceError};
pub use exporter::WorkloadStatusCollector;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{BackoffConfig, PollConfig, PollLoop, TransitionPipeline, WatchLoop};
pub use observability::{AgentMetrics, StructuredLogger};
pub use remediation::{RemediationAction, RemediationWorker};
pub use tracker::StateTracker;
