//! Docker Engine poll source
//!
//! Lists every container (running or not), inspects each one for its
//! lifecycle and health-check status, and normalizes the result.

use super::{Enumeration, PollSource, WorkloadControl};
use crate::error::{RemediationFailed, SourceError};
use crate::models::{HealthState, ObservedRecord, WorkloadIdentity, WorkloadLabels};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, RestartContainerOptions};
use bollard::Docker;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Container as returned by the list call
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
}

/// Status fields read from an inspect call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    pub name: Option<String>,
    /// Lifecycle status (`running`, `exited`, ...)
    pub status: Option<String>,
    /// Health-check status, absent when no health check is configured
    pub health: Option<String>,
}

/// The subset of the Docker Engine API the monitor needs
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, SourceError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, SourceError>;

    async fn restart_container(&self, id: &str) -> Result<(), RemediationFailed>;
}

/// Map raw Docker status strings onto a [`HealthState`]
///
/// While a container runs, its health check (if any) decides: `unhealthy`
/// is Unhealthy, `healthy`/`starting` are Running. A running container
/// without a health check is Running. Otherwise the lifecycle status
/// decides: `exited`/`stopped` are Stopped, anything else is Unknown.
pub fn normalize_container_state(status: Option<&str>, health: Option<&str>) -> HealthState {
    match status {
        Some("running") => match health {
            Some("unhealthy") => HealthState::Unhealthy,
            _ => HealthState::Running,
        },
        Some("exited") | Some("stopped") => HealthState::Stopped,
        _ => HealthState::Unknown,
    }
}

/// Polls a Docker daemon
pub struct DockerSource {
    api: Arc<dyn DockerApi>,
    host: String,
}

impl DockerSource {
    pub fn new(api: Arc<dyn DockerApi>, host: impl Into<String>) -> Self {
        Self {
            api,
            host: host.into(),
        }
    }
}

#[async_trait]
impl PollSource for DockerSource {
    async fn fetch(&self) -> Result<Enumeration, SourceError> {
        let containers = self.api.list_containers().await?;
        let observed_at = Utc::now();
        let mut enumeration = Enumeration::default();

        for container in containers {
            let identity = WorkloadIdentity::container(&container.id);

            let details = match self.api.inspect_container(&container.id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(container_id = %identity, error = %e, "Skipping container");
                    enumeration.unresolved.push(identity);
                    continue;
                }
            };

            let state =
                normalize_container_state(details.status.as_deref(), details.health.as_deref());
            if details.status.as_deref() == Some("running") && details.health.is_none() {
                debug!(container_id = %identity, "Container has no health check defined");
            }

            let name = details
                .name
                .unwrap_or(container.name)
                .trim_start_matches('/')
                .to_string();

            enumeration.records.push(ObservedRecord::new(
                identity,
                state,
                observed_at,
                WorkloadLabels::new(self.host.clone(), name),
            ));
        }

        Ok(enumeration)
    }
}

#[async_trait]
impl WorkloadControl for DockerSource {
    async fn restart(&self, identity: &WorkloadIdentity) -> Result<(), RemediationFailed> {
        // the daemon resolves short ID prefixes
        self.api.restart_container(identity.as_str()).await
    }
}

/// [`DockerApi`] backed by the local Docker daemon
pub struct BollardDockerApi {
    docker: Docker,
}

impl BollardDockerApi {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect_local() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to create Docker client: {}", e))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl DockerApi for BollardDockerApi {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, SourceError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(SourceError::unavailable)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default();
                Some(ContainerSummary { id, name })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, SourceError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SourceError::inspect(WorkloadIdentity::container(id), e))?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerDetails {
            name: response.name,
            status: state.status.map(|s| s.to_string()),
            health: state
                .health
                .and_then(|h| h.status)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty() && s != "none"),
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RemediationFailed> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(|e| RemediationFailed::new(WorkloadIdentity::container(id), e))
    }
}
