//! Ingestion loops and the transition pipeline
//!
//! Every observation flows through the same [`TransitionPipeline`]:
//! tracker ingest, then policy decision, cooldown claim and a non-blocking
//! hand-off to the alert and remediation workers. Two drivers feed it:
//! - [`PollLoop`]: fixed-interval enumeration with absence expiry
//! - [`WatchLoop`]: a subscription that is re-established with
//!   exponential backoff whenever the source becomes unavailable

use crate::alert::{Alert, AlertPolicy, AlertQueue};
use crate::error::SourceError;
use crate::health::{components, HealthRegistry};
use crate::models::{ObservedRecord, SourceKind, TransitionEvent, WorkloadIdentity};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::remediation::RemediationAction;
use crate::source::{PollSource, StreamSource, WatchUpdate};
use crate::tracker::StateTracker;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Turns observations into transitions and dispatches them
pub struct TransitionPipeline {
    tracker: Arc<StateTracker>,
    policy: AlertPolicy,
    source: SourceKind,
    alerts: AlertQueue,
    remediation: Option<mpsc::UnboundedSender<TransitionEvent>>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl TransitionPipeline {
    pub fn new(
        tracker: Arc<StateTracker>,
        source: SourceKind,
        alerts: AlertQueue,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            tracker,
            policy: AlertPolicy::for_source(source),
            source,
            alerts,
            remediation: None,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Forward relevant transitions to a remediation worker
    pub fn with_remediation(mut self, tx: mpsc::UnboundedSender<TransitionEvent>) -> Self {
        self.remediation = Some(tx);
        self
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Ingest one record and dispatch the resulting transition
    pub fn ingest(&self, record: &ObservedRecord) -> Option<TransitionEvent> {
        let event = self.tracker.ingest(record)?;
        self.dispatch(&event);
        Some(event)
    }

    /// Expire workloads absent from a full enumeration
    ///
    /// Returns the number of workloads removed.
    pub fn sweep(&self, seen: &HashSet<WorkloadIdentity>, grace: Duration) -> usize {
        let expired = self.tracker.sweep_absent(seen, Utc::now(), grace);
        for event in &expired {
            self.dispatch(event);
        }
        expired.len()
    }

    fn dispatch(&self, event: &TransitionEvent) {
        self.metrics.inc_transition(event);
        self.logger.log_transition(event);

        if let Some(severity) = self.policy.decide(event).severity() {
            let alert = Alert::from_transition(severity, self.source, event);
            if self.tracker.alert_allowed(&event.identity, event.at) {
                // a dropped alert must not start the cooldown
                if self.alerts.enqueue(alert) {
                    self.tracker.record_alert(&event.identity, event.at);
                } else {
                    self.metrics.inc_alert_dropped();
                }
            } else {
                self.metrics.inc_alert_suppressed();
                self.logger.log_alert_suppressed(&alert);
            }
        }

        if let Some(tx) = &self.remediation {
            if RemediationAction::is_relevant(event) && tx.send(event.clone()).is_err() {
                debug!(workload = %event.identity, "Remediation worker gone, dropping transition");
            }
        }
    }

    fn record_tracked(&self) {
        self.metrics.set_workloads_tracked(self.tracker.len());
    }
}

/// Configuration for the poll loop
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between enumerations (default: 30 seconds)
    pub interval: Duration,
    /// How long a workload may be missing before it is dropped (default: 90 seconds)
    pub absence_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            absence_timeout: Duration::from_secs(90),
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub observed: usize,
    pub transitions: usize,
    pub unresolved: usize,
    pub expired: usize,
}

/// Enumerates a poll source on a fixed interval
pub struct PollLoop {
    source: Arc<dyn PollSource>,
    pipeline: TransitionPipeline,
    config: PollConfig,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl PollLoop {
    pub fn new(
        source: Arc<dyn PollSource>,
        pipeline: TransitionPipeline,
        config: PollConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            source,
            pipeline,
            config,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Run until a shutdown signal arrives; an in-flight cycle always completes
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            absence_timeout_secs = self.config.absence_timeout.as_secs(),
            "Starting poll loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Ok(summary) = self.run_cycle().await {
                        debug!(
                            observed = summary.observed,
                            transitions = summary.transitions,
                            unresolved = summary.unresolved,
                            expired = summary.expired,
                            "Poll cycle complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down poll loop");
                    break;
                }
            }
        }
    }

    /// One enumeration, ingest and sweep
    ///
    /// A failed enumeration is logged and counted; the loop carries on at
    /// the next tick.
    pub async fn run_cycle(&self) -> Result<CycleSummary, SourceError> {
        let start = Instant::now();

        let enumeration = match self.source.fetch().await {
            Ok(enumeration) => enumeration,
            Err(e) => {
                self.metrics.inc_source_error(e.kind());
                self.logger
                    .log_source_unavailable(&e.to_string(), self.config.interval);
                self.health
                    .set_degraded(components::SOURCE, e.to_string())
                    .await;
                return Err(e);
            }
        };

        let mut summary = CycleSummary {
            observed: enumeration.records.len(),
            unresolved: enumeration.unresolved.len(),
            ..Default::default()
        };

        for record in &enumeration.records {
            if self.pipeline.ingest(record).is_some() {
                summary.transitions += 1;
            }
        }
        for _ in &enumeration.unresolved {
            self.metrics.inc_source_error("inspect");
        }

        let seen: HashSet<WorkloadIdentity> = enumeration.seen().cloned().collect();
        summary.expired = self.pipeline.sweep(&seen, self.config.absence_timeout);

        self.pipeline.record_tracked();
        self.health.set_healthy(components::SOURCE).await;
        self.health.mark_synced().await;
        self.metrics.observe_cycle(start.elapsed());

        Ok(summary)
    }
}

/// Exponential backoff settings for resubscribing
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay (default: 1 second)
    pub initial: Duration,
    /// Upper bound on the delay (default: 300 seconds)
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

/// Doubling delay, capped, reset on success
#[derive(Debug)]
struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        let current = config.initial;
        Self { config, current }
    }

    /// Delay to wait now; doubles the next one
    fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.config.max);
        self.current = (self.current * 2).min(self.config.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.config.initial;
    }
}

/// Consumes a stream source, resubscribing from scratch after failures
pub struct WatchLoop {
    source: Arc<dyn StreamSource>,
    pipeline: TransitionPipeline,
    backoff: BackoffConfig,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl WatchLoop {
    pub fn new(
        source: Arc<dyn StreamSource>,
        pipeline: TransitionPipeline,
        backoff: BackoffConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            source,
            pipeline,
            backoff,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            backoff_initial_secs = self.backoff.initial.as_secs(),
            backoff_max_secs = self.backoff.max.as_secs(),
            "Starting watch loop"
        );

        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            let mut stream = self.source.subscribe();

            let reason = loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(update)) => {
                            self.apply(update).await;
                            backoff.reset();
                        }
                        Some(Err(e @ SourceError::Inspect { .. })) => {
                            warn!(error = %e, "Skipping undecodable workload");
                            self.metrics.inc_source_error(e.kind());
                        }
                        Some(Err(e)) => {
                            self.metrics.inc_source_error(e.kind());
                            break e.to_string();
                        }
                        None => break "watch stream ended".to_string(),
                    },
                    _ = shutdown.recv() => {
                        info!("Shutting down watch loop");
                        return;
                    }
                }
            };
            drop(stream);

            let delay = backoff.next_delay();
            self.logger.log_source_unavailable(&reason, delay);
            // still failing once the delay is capped
            if delay >= self.backoff.max {
                self.health.set_unhealthy(components::SOURCE, reason).await;
            } else {
                self.health.set_degraded(components::SOURCE, reason).await;
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down watch loop");
                    return;
                }
            }

            self.metrics.inc_source_reconnect();
            info!("Resubscribing to workload source");
        }
    }

    async fn apply(&self, update: WatchUpdate) {
        match update {
            WatchUpdate::Observed(record) => {
                self.pipeline.ingest(&record);
            }
            WatchUpdate::Resync(records) => {
                let start = Instant::now();
                for record in &records {
                    self.pipeline.ingest(record);
                }
                // a relist is authoritative
                let seen: HashSet<WorkloadIdentity> =
                    records.into_iter().map(|r| r.identity).collect();
                self.pipeline.sweep(&seen, Duration::ZERO);

                self.health.set_healthy(components::SOURCE).await;
                self.health.mark_synced().await;
                self.metrics.observe_cycle(start.elapsed());
            }
        }
        self.pipeline.record_tracked();
    }
}
