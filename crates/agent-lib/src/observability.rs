//! Observability for the monitor itself
//!
//! Provides:
//! - Prometheus self-metrics (cycle latency, transitions, alert delivery, source errors)
//! - Structured JSON event logging with tracing

use crate::alert::Alert;
use crate::models::{SourceKind, TransitionEvent, WorkloadIdentity};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for ingest cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_latency_seconds: Histogram,
    workloads_tracked: IntGauge,
    transitions: IntCounterVec,
    alerts_sent: IntCounterVec,
    alerts_suppressed: IntCounter,
    alerts_dropped: IntCounter,
    delivery_failures: IntCounter,
    source_errors: IntCounterVec,
    source_reconnects: IntCounter,
    remediations: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "sentinel_ingest_cycle_seconds",
                "Time spent on one poll cycle or resync",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register ingest_cycle_seconds"),

            workloads_tracked: register_int_gauge!(
                "sentinel_workloads_tracked",
                "Number of workloads currently tracked"
            )
            .expect("Failed to register workloads_tracked"),

            transitions: register_int_counter_vec!(
                "sentinel_transitions_total",
                "Workload state transitions by target state",
                &["to"]
            )
            .expect("Failed to register transitions_total"),

            alerts_sent: register_int_counter_vec!(
                "sentinel_alerts_sent_total",
                "Alerts delivered to the sink by severity",
                &["severity"]
            )
            .expect("Failed to register alerts_sent_total"),

            alerts_suppressed: register_int_counter!(
                "sentinel_alerts_suppressed_total",
                "Alerts suppressed by the per-workload cooldown"
            )
            .expect("Failed to register alerts_suppressed_total"),

            alerts_dropped: register_int_counter!(
                "sentinel_alerts_dropped_total",
                "Alerts dropped because the delivery queue was full"
            )
            .expect("Failed to register alerts_dropped_total"),

            delivery_failures: register_int_counter!(
                "sentinel_alert_delivery_failures_total",
                "Alerts that could not be delivered after retrying"
            )
            .expect("Failed to register alert_delivery_failures_total"),

            source_errors: register_int_counter_vec!(
                "sentinel_source_errors_total",
                "Workload source errors by kind",
                &["kind"]
            )
            .expect("Failed to register source_errors_total"),

            source_reconnects: register_int_counter!(
                "sentinel_source_reconnects_total",
                "Times the streaming source was resubscribed"
            )
            .expect("Failed to register source_reconnects_total"),

            remediations: register_int_counter_vec!(
                "sentinel_remediations_total",
                "Restart attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register remediations_total"),
        }
    }
}

/// Lightweight handle to the global self-metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_cycle(&self, elapsed: Duration) {
        self.inner()
            .cycle_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_workloads_tracked(&self, count: usize) {
        self.inner().workloads_tracked.set(count as i64);
    }

    pub fn inc_transition(&self, event: &TransitionEvent) {
        self.inner()
            .transitions
            .with_label_values(&[event.to.as_str()])
            .inc();
    }

    pub fn inc_alert_sent(&self, alert: &Alert) {
        self.inner()
            .alerts_sent
            .with_label_values(&[&alert.severity.to_string()])
            .inc();
    }

    pub fn inc_alert_suppressed(&self) {
        self.inner().alerts_suppressed.inc();
    }

    pub fn inc_alert_dropped(&self) {
        self.inner().alerts_dropped.inc();
    }

    pub fn inc_delivery_failure(&self) {
        self.inner().delivery_failures.inc();
    }

    pub fn inc_source_error(&self, kind: &str) {
        self.inner().source_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_source_reconnect(&self) {
        self.inner().source_reconnects.inc();
    }

    pub fn inc_remediation(&self, success: bool) {
        let outcome = if success { "restarted" } else { "failed" };
        self.inner().remediations.with_label_values(&[outcome]).inc();
    }
}

/// Structured logger for monitor events
///
/// Keeps field names consistent across every event the agent emits.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, source: SourceKind) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            source = %source,
            "Workload sentinel started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Workload sentinel shutting down"
        );
    }

    pub fn log_transition(&self, transition: &TransitionEvent) {
        let from = transition
            .from
            .map(|s| s.as_str())
            .unwrap_or("none");
        info!(
            event = "workload_transition",
            node = %self.node_name,
            workload = %transition.identity,
            scope = %transition.labels.scope,
            name = %transition.labels.name,
            from = %from,
            to = %transition.to,
            "Workload state changed"
        );
    }

    pub fn log_alert_sent(&self, alert: &Alert) {
        info!(
            event = "alert_sent",
            node = %self.node_name,
            workload = %alert.identity,
            severity = %alert.severity,
            to = %alert.to,
            "Alert delivered"
        );
    }

    pub fn log_alert_suppressed(&self, alert: &Alert) {
        info!(
            event = "alert_suppressed",
            node = %self.node_name,
            workload = %alert.identity,
            severity = %alert.severity,
            to = %alert.to,
            "Alert suppressed by cooldown"
        );
    }

    pub fn log_delivery_failure(&self, alert: &Alert, error: &str, attempts: u32) {
        warn!(
            event = "alert_delivery_failed",
            node = %self.node_name,
            workload = %alert.identity,
            severity = %alert.severity,
            attempts = attempts,
            error = %error,
            "Alert could not be delivered"
        );
    }

    pub fn log_remediation(&self, identity: &WorkloadIdentity, error: Option<&str>) {
        match error {
            None => info!(
                event = "remediation_restarted",
                node = %self.node_name,
                workload = %identity,
                "Restarted unhealthy workload"
            ),
            Some(error) => warn!(
                event = "remediation_failed",
                node = %self.node_name,
                workload = %identity,
                error = %error,
                "Failed to restart unhealthy workload"
            ),
        }
    }

    pub fn log_source_unavailable(&self, error: &str, retry_in: Duration) {
        warn!(
            event = "source_unavailable",
            node = %self.node_name,
            error = %error,
            retry_in_secs = retry_in.as_secs(),
            "Workload source unavailable"
        );
    }
}
