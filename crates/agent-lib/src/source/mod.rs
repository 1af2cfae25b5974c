//! Workload sources
//!
//! Adapters that observe workloads and normalize their raw status into
//! [`ObservedRecord`]s. Two shapes exist:
//! - [`PollSource`]: one-shot enumeration, called on a fixed interval (Docker)
//! - [`StreamSource`]: an infinite, restartable update stream (Kubernetes)
//!
//! Sources that can act on workloads also implement [`WorkloadControl`].

mod docker;
mod kubernetes;

pub use docker::{
    normalize_container_state, BollardDockerApi, ContainerDetails, ContainerSummary, DockerApi,
    DockerSource,
};
pub use kubernetes::{decode_pod, kube_client, normalize_pod_phase, PodControl, PodWatchSource};

use crate::error::{RemediationFailed, SourceError};
use crate::models::{ObservedRecord, WorkloadIdentity};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Result of one full enumeration
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub records: Vec<ObservedRecord>,
    /// Workloads that were listed but whose details could not be read
    pub unresolved: Vec<WorkloadIdentity>,
}

impl Enumeration {
    /// Every identity the enumeration saw, resolved or not
    pub fn seen(&self) -> impl Iterator<Item = &WorkloadIdentity> {
        self.records
            .iter()
            .map(|r| &r.identity)
            .chain(self.unresolved.iter())
    }
}

/// A source enumerated on a fixed interval
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch(&self) -> Result<Enumeration, SourceError>;
}

/// One item from a streaming source
#[derive(Debug, Clone, PartialEq)]
pub enum WatchUpdate {
    /// A single workload was added, modified or deleted
    Observed(ObservedRecord),
    /// Authoritative full listing; anything missing is gone
    Resync(Vec<ObservedRecord>),
}

/// A source that pushes updates
///
/// `subscribe` starts from scratch every time it is called; no resume
/// token is carried between subscriptions.
pub trait StreamSource: Send + Sync {
    fn subscribe(&self) -> BoxStream<'static, Result<WatchUpdate, SourceError>>;
}

/// Ability to restart a workload
#[async_trait]
pub trait WorkloadControl: Send + Sync {
    async fn restart(&self, identity: &WorkloadIdentity) -> Result<(), RemediationFailed>;
}
