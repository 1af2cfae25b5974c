//! Restart-on-unhealthy remediation
//!
//! A single optional action: when a workload transitions into
//! `Unhealthy`, ask the source to restart it once. The identity is then
//! disarmed until it leaves `Unhealthy` again, so a workload that stays
//! broken is never restarted in a loop.

use crate::error::RemediationFailed;
use crate::health::{components, HealthRegistry};
use crate::models::{HealthState, TransitionEvent, WorkloadIdentity};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::source::WorkloadControl;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Restarts workloads that turn unhealthy, at most once per episode
pub struct RemediationAction {
    control: Arc<dyn WorkloadControl>,
    /// Identities already restarted in their current unhealthy episode
    disarmed: DashSet<WorkloadIdentity>,
}

impl RemediationAction {
    pub fn new(control: Arc<dyn WorkloadControl>) -> Self {
        Self {
            control,
            disarmed: DashSet::new(),
        }
    }

    /// Whether a transition can change what this action does
    pub fn is_relevant(event: &TransitionEvent) -> bool {
        event.to == HealthState::Unhealthy
            || event.to == HealthState::Deleted
            || event.from == Some(HealthState::Unhealthy)
    }

    pub fn is_armed(&self, identity: &WorkloadIdentity) -> bool {
        !self.disarmed.contains(identity)
    }

    /// Act on one transition
    ///
    /// Returns `Ok(true)` when a restart was issued. A failed restart
    /// still disarms the identity.
    pub async fn maybe_act(&self, event: &TransitionEvent) -> Result<bool, RemediationFailed> {
        match event.to {
            HealthState::Deleted => {
                self.disarmed.remove(&event.identity);
                Ok(false)
            }
            HealthState::Unhealthy => {
                if !self.disarmed.insert(event.identity.clone()) {
                    debug!(workload = %event.identity, "Already restarted this episode, skipping");
                    return Ok(false);
                }
                self.control.restart(&event.identity).await?;
                Ok(true)
            }
            _ => {
                if event.from == Some(HealthState::Unhealthy) {
                    self.disarmed.remove(&event.identity);
                }
                Ok(false)
            }
        }
    }
}

/// Feeds transitions to a [`RemediationAction`] in arrival order
pub struct RemediationWorker {
    action: RemediationAction,
    rx: mpsc::UnboundedReceiver<TransitionEvent>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl RemediationWorker {
    pub fn new(
        action: RemediationAction,
        rx: mpsc::UnboundedReceiver<TransitionEvent>,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            action,
            rx,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    pub async fn run(mut self) {
        info!("Starting remediation worker");

        while let Some(event) = self.rx.recv().await {
            match self.action.maybe_act(&event).await {
                Ok(true) => {
                    self.metrics.inc_remediation(true);
                    self.logger.log_remediation(&event.identity, None);
                    self.health.set_healthy(components::REMEDIATION).await;
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.inc_remediation(false);
                    self.logger
                        .log_remediation(&event.identity, Some(&e.to_string()));
                    self.health
                        .set_degraded(components::REMEDIATION, e.to_string())
                        .await;
                }
            }
        }

        info!("Remediation channel closed, worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::models::WorkloadLabels;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct FakeControl {
        restarts: Mutex<Vec<WorkloadIdentity>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkloadControl for FakeControl {
        async fn restart(&self, identity: &WorkloadIdentity) -> Result<(), RemediationFailed> {
            self.restarts.lock().unwrap().push(identity.clone());
            if self.fail {
                return Err(RemediationFailed::new(identity.clone(), "daemon refused"));
            }
            Ok(())
        }
    }

    fn event(from: Option<HealthState>, to: HealthState) -> TransitionEvent {
        TransitionEvent {
            identity: WorkloadIdentity::new("abc123def456"),
            labels: WorkloadLabels::new("host-1", "web"),
            from,
            to,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_restarts_once_per_unhealthy_episode() {
        let control = Arc::new(FakeControl::default());
        let action = RemediationAction::new(control.clone());

        assert!(action
            .maybe_act(&event(Some(HealthState::Running), HealthState::Unhealthy))
            .await
            .unwrap());
        assert!(!action.is_armed(&WorkloadIdentity::new("abc123def456")));

        // the restart may itself bounce through other states
        assert!(!action
            .maybe_act(&event(Some(HealthState::Unhealthy), HealthState::Unhealthy))
            .await
            .unwrap());
        assert_eq!(control.restarts.lock().unwrap().len(), 1);

        // leaving unhealthy re-arms
        assert_ok!(
            action
                .maybe_act(&event(Some(HealthState::Unhealthy), HealthState::Running))
                .await
        );
        assert!(action
            .maybe_act(&event(Some(HealthState::Running), HealthState::Unhealthy))
            .await
            .unwrap());
        assert_eq!(control.restarts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ignores_other_transitions() {
        let control = Arc::new(FakeControl::default());
        let action = RemediationAction::new(control.clone());

        for to in [HealthState::Failed, HealthState::Stopped, HealthState::Unknown] {
            assert!(!action
                .maybe_act(&event(Some(HealthState::Running), to))
                .await
                .unwrap());
        }
        assert!(control.restarts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restart_stays_disarmed() {
        let control = Arc::new(FakeControl {
            fail: true,
            ..Default::default()
        });
        let action = RemediationAction::new(control.clone());

        let err = assert_err!(action.maybe_act(&event(None, HealthState::Unhealthy)).await);
        assert_eq!(err.identity.as_str(), "abc123def456");

        assert!(!action
            .maybe_act(&event(Some(HealthState::Unhealthy), HealthState::Unhealthy))
            .await
            .unwrap());
        assert_eq!(control.restarts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_forgets_identity() {
        let action = RemediationAction::new(Arc::new(FakeControl::default()));
        let id = WorkloadIdentity::new("abc123def456");

        assert_ok!(action.maybe_act(&event(None, HealthState::Unhealthy)).await);
        assert!(!action.is_armed(&id));

        assert_ok!(
            action
                .maybe_act(&event(Some(HealthState::Unhealthy), HealthState::Deleted))
                .await
        );
        assert!(action.is_armed(&id));
    }

    #[test]
    fn test_is_relevant() {
        assert!(RemediationAction::is_relevant(&event(
            Some(HealthState::Running),
            HealthState::Unhealthy
        )));
        assert!(RemediationAction::is_relevant(&event(
            Some(HealthState::Unhealthy),
            HealthState::Stopped
        )));
        assert!(!RemediationAction::is_relevant(&event(
            Some(HealthState::Running),
            HealthState::Stopped
        )));
    }

    #[tokio::test]
    async fn test_worker_marks_component_degraded_on_failure() {
        let control = Arc::new(FakeControl {
            fail: true,
            ..Default::default()
        });
        let health = HealthRegistry::new();
        health.register(components::REMEDIATION).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RemediationWorker::new(
            RemediationAction::new(control),
            rx,
            health.clone(),
            StructuredLogger::new("test-node"),
        );

        tx.send(event(Some(HealthState::Running), HealthState::Unhealthy))
            .unwrap();
        drop(tx);
        worker.run().await;

        let response = health.health().await;
        assert_eq!(
            response.components[components::REMEDIATION].status,
            ComponentStatus::Degraded
        );
    }
}
