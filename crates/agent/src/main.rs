//! Workload sentinel agent
//!
//! Watches Docker containers or Kubernetes pods, alerts on health
//! transitions and exports workload health for Prometheus.

use agent_lib::{
    alert::{build_notifier, AlertQueue, NotifierWorker},
    health::{components, HealthRegistry},
    monitor::{BackoffConfig, PollConfig, PollLoop, TransitionPipeline, WatchLoop},
    observability::{AgentMetrics, StructuredLogger},
    remediation::{RemediationAction, RemediationWorker},
    source::{
        kube_client, BollardDockerApi, DockerSource, PodControl, PodWatchSource, WorkloadControl,
    },
    SourceKind, StateTracker, WorkloadStatusCollector,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        source = %config.source,
        remediation = config.remediation_enabled,
        "Agent configured"
    );

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.source);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SOURCE).await;
    health_registry.register(components::NOTIFIER).await;
    if config.remediation_enabled {
        health_registry.register(components::REMEDIATION).await;
    }

    // Self-metrics and the workload gauges share the default registry
    let _metrics = AgentMetrics::new();
    let tracker = Arc::new(StateTracker::new(config.cooldown()));
    prometheus::register(Box::new(WorkloadStatusCollector::new(
        tracker.clone(),
        config.source,
    )?))
    .context("Failed to register workload status collector")?;

    // A taken API port is fatal
    let listener = api::bind(config.api_port).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Alert delivery
    let notifier = build_notifier(&config.notifier_config())?;
    let (alert_queue, alert_rx) = AlertQueue::new(config.alert_queue_size);
    let notifier_handle = tokio::spawn(
        NotifierWorker::new(
            notifier,
            alert_rx,
            config.notify_retry,
            health_registry.clone(),
            logger.clone(),
        )
        .run(),
    );

    let mut pipeline =
        TransitionPipeline::new(tracker.clone(), config.source, alert_queue, logger.clone());

    // Client construction is the only fatal source failure
    let (ingest_handle, remediation_handle) = match config.source {
        SourceKind::Docker => {
            let docker = Arc::new(
                BollardDockerApi::connect_local().context("Docker client construction failed")?,
            );
            let source = Arc::new(DockerSource::new(docker, config.node_name.clone()));

            let (remediation_tx, remediation_handle) =
                spawn_remediation(&config, source.clone(), &health_registry, &logger);
            if let Some(tx) = remediation_tx {
                pipeline = pipeline.with_remediation(tx);
            }

            let poll = PollLoop::new(
                source,
                pipeline,
                PollConfig {
                    interval: config.poll_interval(),
                    absence_timeout: config.absence_timeout(),
                },
                health_registry.clone(),
                logger.clone(),
            );
            (
                tokio::spawn(poll.run(shutdown_tx.subscribe())),
                remediation_handle,
            )
        }
        SourceKind::Kubernetes => {
            let client = kube_client(config.kubeconfig.as_deref())
                .await
                .context("Kubernetes client construction failed")?;
            let source = Arc::new(PodWatchSource::new(
                client.clone(),
                config.watch_namespace.clone(),
            ));

            let (remediation_tx, remediation_handle) = spawn_remediation(
                &config,
                Arc::new(PodControl::new(client)),
                &health_registry,
                &logger,
            );
            if let Some(tx) = remediation_tx {
                pipeline = pipeline.with_remediation(tx);
            }

            let watch = WatchLoop::new(
                source,
                pipeline,
                BackoffConfig {
                    initial: Duration::from_secs(config.backoff_initial_secs),
                    max: Duration::from_secs(config.backoff_max_secs),
                },
                health_registry.clone(),
                logger.clone(),
            );
            (
                tokio::spawn(watch.run(shutdown_tx.subscribe())),
                remediation_handle,
            )
        }
    };

    run_until_shutdown(
        &config,
        listener,
        &tracker,
        &health_registry,
        &logger,
        shutdown_tx,
        ingest_handle,
        notifier_handle,
        remediation_handle,
    )
    .await
}

type RemediationParts = (
    Option<mpsc::UnboundedSender<agent_lib::TransitionEvent>>,
    Option<JoinHandle<()>>,
);

/// Start the remediation worker when enabled
fn spawn_remediation(
    config: &config::AgentConfig,
    control: Arc<dyn WorkloadControl>,
    health: &HealthRegistry,
    logger: &StructuredLogger,
) -> RemediationParts {
    if !config.remediation_enabled {
        return (None, None);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let worker = RemediationWorker::new(
        RemediationAction::new(control),
        rx,
        health.clone(),
        logger.clone(),
    );
    (Some(tx), Some(tokio::spawn(worker.run())))
}

/// Serve the API until a signal arrives, then drain within the grace period
#[allow(clippy::too_many_arguments)]
async fn run_until_shutdown(
    config: &config::AgentConfig,
    listener: tokio::net::TcpListener,
    tracker: &Arc<StateTracker>,
    health_registry: &HealthRegistry,
    logger: &StructuredLogger,
    shutdown_tx: broadcast::Sender<()>,
    ingest_handle: JoinHandle<()>,
    notifier_handle: JoinHandle<()>,
    remediation_handle: Option<JoinHandle<()>>,
) -> Result<()> {
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        tracker.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(listener, app_state, shutdown_tx.subscribe()));

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    // The ingestion loop owns the queue senders, so once it exits the
    // workers see their channels close and drain what is left.
    let drain = async {
        if let Err(e) = ingest_handle.await {
            error!(error = %e, "Ingestion task failed");
        }
        if let Err(e) = notifier_handle.await {
            error!(error = %e, "Notifier worker failed");
        }
        if let Some(handle) = remediation_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Remediation worker failed");
            }
        }
        match api_handle.await {
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Err(e) => error!(error = %e, "API server task failed"),
            Ok(Ok(())) => {}
        }
    };

    if tokio::time::timeout(config.shutdown_grace(), drain)
        .await
        .is_err()
    {
        warn!(
            grace_secs = config.shutdown_grace_secs,
            "Shutdown drain timed out, exiting anyway"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT received")
            }
            _ = terminate.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for SIGINT")?;
        Ok("SIGINT received")
    }
}
