//! Prometheus exporter for workload health
//!
//! Exposes one gauge per tracked workload with the numeric encoding from
//! [`HealthState::gauge_value`]. The gauge family is rebuilt from a
//! tracker snapshot on every scrape, so workloads that stop being
//! tracked disappear from the very next scrape.

use crate::models::{SourceKind, TrackedEntry};
use crate::tracker::StateTracker;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};
use std::sync::Arc;
use tracing::warn;

/// Metric name and label names for one source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMetric {
    pub name: &'static str,
    pub help: &'static str,
    pub scope_label: &'static str,
    pub identity_label: &'static str,
}

impl StatusMetric {
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Docker => Self {
                name: "docker_container_status",
                help: "Container health (1=running, 0=stopped, -1=unhealthy, -2=other)",
                scope_label: "host",
                identity_label: "container_id",
            },
            SourceKind::Kubernetes => Self {
                name: "kubernetes_pod_status",
                help: "Pod health (1=running, 0=stopped, -1=unhealthy, -2=other)",
                scope_label: "namespace",
                identity_label: "pod",
            },
        }
    }

    fn gauge_vec(&self) -> prometheus::Result<GaugeVec> {
        GaugeVec::new(
            Opts::new(self.name, self.help),
            &[self.scope_label, self.identity_label],
        )
    }

    /// Value of the identity label for an entry
    fn identity_value<'a>(&self, kind: SourceKind, entry: &'a TrackedEntry) -> &'a str {
        match kind {
            SourceKind::Docker => entry.identity.as_str(),
            // the namespace already has its own label
            SourceKind::Kubernetes => &entry.labels.name,
        }
    }
}

/// Scrape-time collector over the state tracker
pub struct WorkloadStatusCollector {
    tracker: Arc<StateTracker>,
    kind: SourceKind,
    metric: StatusMetric,
    /// Only used to describe the family to the registry
    template: GaugeVec,
}

impl WorkloadStatusCollector {
    pub fn new(tracker: Arc<StateTracker>, kind: SourceKind) -> prometheus::Result<Self> {
        let metric = StatusMetric::for_source(kind);
        let template = metric.gauge_vec()?;
        Ok(Self {
            tracker,
            kind,
            metric,
            template,
        })
    }

    pub fn metric(&self) -> StatusMetric {
        self.metric
    }
}

impl Collector for WorkloadStatusCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.template.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let gauges = match self.metric.gauge_vec() {
            Ok(gauges) => gauges,
            Err(e) => {
                warn!(error = %e, "Failed to build workload status gauge");
                return Vec::new();
            }
        };

        for entry in self.tracker.snapshot() {
            let identity = self.metric.identity_value(self.kind, &entry);
            gauges
                .with_label_values(&[entry.labels.scope.as_str(), identity])
                .set(entry.current_state.gauge_value());
        }

        gauges.collect()
    }
}
