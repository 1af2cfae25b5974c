//! Kubernetes pod watch source
//!
//! Streams pod changes across all namespaces. Every watcher event is
//! decoded into a tagged [`WatchUpdate`]; pods that cannot be decoded
//! fail closed as inspect errors instead of being guessed at.

use super::{StreamSource, WatchUpdate, WorkloadControl};
use crate::error::{RemediationFailed, SourceError};
use crate::models::{HealthState, ObservedRecord, WorkloadIdentity, WorkloadLabels};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::Client;
use std::path::Path;
use tracing::{info, warn};

/// Map a pod phase onto a [`HealthState`]
pub fn normalize_pod_phase(phase: Option<&str>) -> HealthState {
    match phase {
        Some("Running") => HealthState::Running,
        Some("Pending") => HealthState::Pending,
        Some("Succeeded") => HealthState::Stopped,
        Some("Failed") => HealthState::Failed,
        _ => HealthState::Unknown,
    }
}

/// Decode a pod into a record, failing if it has no name
pub fn decode_pod(pod: &Pod, observed_at: DateTime<Utc>) -> Result<ObservedRecord, SourceError> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().ok_or_else(|| {
        SourceError::inspect(
            WorkloadIdentity::pod(namespace, "<unnamed>"),
            "pod object has no metadata.name",
        )
    })?;

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());

    Ok(ObservedRecord::new(
        WorkloadIdentity::pod(namespace, name),
        normalize_pod_phase(phase),
        observed_at,
        WorkloadLabels::new(namespace, name),
    ))
}

/// Turn one watcher event into an update
pub(crate) fn decode_event(
    event: watcher::Event<Pod>,
    observed_at: DateTime<Utc>,
) -> Result<WatchUpdate, SourceError> {
    match event {
        watcher::Event::Applied(pod) => decode_pod(&pod, observed_at).map(WatchUpdate::Observed),
        watcher::Event::Deleted(pod) => decode_pod(&pod, observed_at).map(|mut record| {
            record.state = HealthState::Deleted;
            WatchUpdate::Observed(record)
        }),
        watcher::Event::Restarted(pods) => {
            let records = pods
                .iter()
                .filter_map(|pod| match decode_pod(pod, observed_at) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable pod in relist");
                        None
                    }
                })
                .collect();
            Ok(WatchUpdate::Resync(records))
        }
    }
}

/// Build a client from an explicit kubeconfig, or in-cluster first and
/// the default kubeconfig second
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => match kube::Config::incluster() {
            Ok(config) => {
                info!("Using in-cluster Kubernetes configuration");
                config
            }
            Err(_) => kube::Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?,
        },
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Watches pods across all namespaces, or one namespace when set
pub struct PodWatchSource {
    client: Client,
    namespace: Option<String>,
}

impl PodWatchSource {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self) -> Api<Pod> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

impl StreamSource for PodWatchSource {
    fn subscribe(&self) -> BoxStream<'static, Result<WatchUpdate, SourceError>> {
        watcher(self.api(), watcher::Config::default())
            .map(|event| match event {
                Ok(event) => decode_event(event, Utc::now()),
                Err(e) => Err(SourceError::unavailable(e)),
            })
            // the watcher retries internally; surface the first error so the
            // caller can back off and resubscribe from scratch
            .scan(false, |failed, item| {
                if *failed {
                    return future::ready(None);
                }
                *failed = matches!(item, Err(SourceError::Unavailable(_)));
                future::ready(Some(item))
            })
            .boxed()
    }
}

/// Restarts pods by deleting them so their controller recreates them
pub struct PodControl {
    client: Client,
}

impl PodControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadControl for PodControl {
    async fn restart(&self, identity: &WorkloadIdentity) -> Result<(), RemediationFailed> {
        let (namespace, name) = identity
            .as_str()
            .split_once('/')
            .ok_or_else(|| RemediationFailed::new(identity.clone(), "not a pod identity"))?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| RemediationFailed::new(identity.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: &str, name: Option<&str>, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: phase.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_pod_phase() {
        assert_eq!(normalize_pod_phase(Some("Running")), HealthState::Running);
        assert_eq!(normalize_pod_phase(Some("Pending")), HealthState::Pending);
        assert_eq!(normalize_pod_phase(Some("Succeeded")), HealthState::Stopped);
        assert_eq!(normalize_pod_phase(Some("Failed")), HealthState::Failed);
        assert_eq!(normalize_pod_phase(Some("Unknown")), HealthState::Unknown);
        assert_eq!(normalize_pod_phase(None), HealthState::Unknown);
    }

    #[test]
    fn test_decode_pod() {
        let record = decode_pod(&pod("kube-system", Some("coredns-1"), Some("Running")), Utc::now())
            .unwrap();
        assert_eq!(record.identity.as_str(), "kube-system/coredns-1");
        assert_eq!(record.state, HealthState::Running);
        assert_eq!(record.labels.scope, "kube-system");
        assert_eq!(record.labels.name, "coredns-1");
    }

    #[test]
    fn test_decode_pod_without_name_fails_closed() {
        let err = decode_pod(&pod("default", None, Some("Running")), Utc::now()).unwrap_err();
        assert!(matches!(err, SourceError::Inspect { .. }));
    }

    #[test]
    fn test_decode_deleted_event() {
        let update = decode_event(
            watcher::Event::Deleted(pod("default", Some("web-0"), Some("Running"))),
            Utc::now(),
        )
        .unwrap();

        match update {
            WatchUpdate::Observed(record) => {
                assert_eq!(record.state, HealthState::Deleted);
                assert_eq!(record.identity.as_str(), "default/web-0");
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_decode_restart_skips_bad_pods() {
        let update = decode_event(
            watcher::Event::Restarted(vec![
                pod("default", Some("web-0"), Some("Running")),
                pod("default", None, Some("Running")),
                pod("jobs", Some("batch-1"), Some("Succeeded")),
            ]),
            Utc::now(),
        )
        .unwrap();

        match update {
            WatchUpdate::Resync(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[1].state, HealthState::Stopped);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }
}
