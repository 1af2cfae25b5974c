//! Alert delivery to the configured sink
//!
//! Handles:
//! - Rendering a transition into a human readable message
//! - Posting to a webhook (`{"text": ...}`) or the Slack chat API
//! - One immediate retry on failure
//! - Decoupling delivery from ingestion through a bounded queue

use super::policy::AlertSeverity;
use crate::error::DeliveryFailed;
use crate::health::{components, HealthRegistry};
use crate::models::{HealthState, SourceKind, TransitionEvent, WorkloadIdentity, WorkloadLabels};
use crate::observability::{AgentMetrics, StructuredLogger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Slack Web API endpoint for posting messages
pub const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// A notification about one workload transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub source: SourceKind,
    pub identity: WorkloadIdentity,
    pub labels: WorkloadLabels,
    pub from: Option<HealthState>,
    pub to: HealthState,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn from_transition(
        severity: AlertSeverity,
        source: SourceKind,
        transition: &TransitionEvent,
    ) -> Self {
        Self {
            severity,
            source,
            identity: transition.identity.clone(),
            labels: transition.labels.clone(),
            from: transition.from,
            to: transition.to,
            at: transition.at,
        }
    }

    /// Which workload this is about, in the source's own terms
    fn subject(&self) -> String {
        match self.source {
            SourceKind::Docker => {
                let name = self.labels.name.trim_start_matches('/');
                if name.is_empty() {
                    format!("docker container {} on {}", self.identity, self.labels.scope)
                } else {
                    format!(
                        "docker container {} ({}) on {}",
                        name, self.identity, self.labels.scope
                    )
                }
            }
            SourceKind::Kubernetes => format!("pod {}", self.identity),
        }
    }

    /// Human readable message body
    pub fn text(&self) -> String {
        let tag = match self.severity {
            AlertSeverity::Critical => "[CRITICAL]",
            AlertSeverity::Info => "[INFO]",
        };
        let subject = self.subject();

        let body = match (self.from, self.to) {
            (_, HealthState::Deleted) => format!("{} was removed", subject),
            (Some(from), HealthState::Running) if self.severity == AlertSeverity::Info => {
                format!("{} recovered: now running (was {})", subject, from)
            }
            (Some(from), to) => format!("{} is {} (was {})", subject, to, from),
            (None, to) => format!("{} is {}", subject, to),
        };

        format!("{} {}", tag, body)
    }
}

/// A single alert sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short sink name for logs
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), DeliveryFailed>;
}

/// Explicit sink configuration handed to [`build_notifier`]
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Webhook URL; takes precedence over Slack when set
    pub webhook_url: Option<String>,
    pub slack_channel: String,
    pub slack_token: Option<String>,
    pub slack_api_url: String,
    pub timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            slack_channel: "#alerts".to_string(),
            slack_token: None,
            slack_api_url: SLACK_POST_MESSAGE_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

/// Pick the sink described by the configuration
pub fn build_notifier(config: &NotifierConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        if config.slack_token.is_some() {
            warn!("Both webhook and Slack token configured, using webhook");
        }
        info!(url = %url, "Alerts will be posted to webhook");
        return Ok(Arc::new(WebhookNotifier::new(url, config.timeout)?));
    }

    if let Some(token) = config.slack_token.as_deref().filter(|t| !t.is_empty()) {
        info!(channel = %config.slack_channel, "Alerts will be posted to Slack");
        return Ok(Arc::new(SlackNotifier::new(
            &config.slack_api_url,
            &config.slack_channel,
            token,
            config.timeout,
        )?));
    }

    warn!("No alert sink configured, alerts will only be logged");
    Ok(Arc::new(LogNotifier))
}

/// Posts `{"text": ...}` JSON to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DeliveryFailed> {
        let text = alert.text();
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { text: &text })
            .send()
            .await
            .map_err(|e| DeliveryFailed::new(self.name(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryFailed::new(
                self.name(),
                format!("webhook returned {}: {}", status, body),
            ));
        }

        Ok(())
    }
}

/// Posts messages through Slack's `chat.postMessage`
pub struct SlackNotifier {
    client: reqwest::Client,
    api_url: String,
    channel: String,
    token: String,
}

impl SlackNotifier {
    pub fn new(
        api_url: impl Into<String>,
        channel: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.into(),
            channel: channel.into(),
            token: token.into(),
        })
    }
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DeliveryFailed> {
        let text = alert.text();
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&SlackMessage {
                channel: &self.channel,
                text: &text,
            })
            .send()
            .await
            .map_err(|e| DeliveryFailed::new(self.name(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryFailed::new(
                self.name(),
                format!("Slack API returned {}", status),
            ));
        }

        // Slack reports most failures as 200 with ok=false
        let body: SlackResponse = response
            .json()
            .await
            .map_err(|e| DeliveryFailed::new(self.name(), format!("invalid response: {}", e)))?;
        if !body.ok {
            return Err(DeliveryFailed::new(
                self.name(),
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(())
    }
}

/// Fallback sink that only logs
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DeliveryFailed> {
        info!(severity = %alert.severity, workload = %alert.identity, "{}", alert.text());
        Ok(())
    }
}

/// Send an alert, retrying once immediately when `retry_once` is set
///
/// Returns the number of attempts made alongside the final result.
pub async fn deliver(
    notifier: &dyn Notifier,
    alert: &Alert,
    retry_once: bool,
) -> (u32, Result<(), DeliveryFailed>) {
    match notifier.send(alert).await {
        Ok(()) => (1, Ok(())),
        Err(e) if retry_once => {
            debug!(error = %e, workload = %alert.identity, "Alert delivery failed, retrying once");
            (2, notifier.send(alert).await)
        }
        Err(e) => (1, Err(e)),
    }
}

/// Sending half of the alert queue, held by the ingestion pipeline
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<Alert>,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting; returns false if the queue is full or closed
    pub fn enqueue(&self, alert: Alert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(workload = %alert.identity, "Alert queue full, dropping alert");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Delivers queued alerts until every [`AlertQueue`] handle is dropped
pub struct NotifierWorker {
    notifier: Arc<dyn Notifier>,
    rx: mpsc::Receiver<Alert>,
    retry_once: bool,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl NotifierWorker {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        rx: mpsc::Receiver<Alert>,
        retry_once: bool,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            notifier,
            rx,
            retry_once,
            health,
            metrics: AgentMetrics::new(),
            logger,
        }
    }

    pub async fn run(mut self) {
        info!(sink = self.notifier.name(), "Starting alert delivery worker");

        while let Some(alert) = self.rx.recv().await {
            let (attempts, result) = deliver(self.notifier.as_ref(), &alert, self.retry_once).await;
            match result {
                Ok(()) => {
                    self.metrics.inc_alert_sent(&alert);
                    self.logger.log_alert_sent(&alert);
                    self.health.set_healthy(components::NOTIFIER).await;
                }
                Err(e) => {
                    self.metrics.inc_delivery_failure();
                    self.logger
                        .log_delivery_failure(&alert, &e.to_string(), attempts);
                    self.health
                        .set_degraded(components::NOTIFIER, e.to_string())
                        .await;
                }
            }
        }

        info!("Alert queue closed, delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_alert(severity: AlertSeverity, from: Option<HealthState>, to: HealthState) -> Alert {
        Alert {
            severity,
            source: SourceKind::Docker,
            identity: WorkloadIdentity::new("abc123def456"),
            labels: WorkloadLabels::new("host-1", "/web"),
            from,
            to,
            at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    /// Fails a fixed number of times, then succeeds
    struct FlakyNotifier {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyNotifier {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), DeliveryFailed> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryFailed::new("flaky", "boom"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_alert_text_critical() {
        let alert = test_alert(
            AlertSeverity::Critical,
            Some(HealthState::Running),
            HealthState::Unhealthy,
        );
        assert_eq!(
            alert.text(),
            "[CRITICAL] docker container web (abc123def456) on host-1 is unhealthy (was running)"
        );
    }

    #[test]
    fn test_alert_text_recovery_and_removal() {
        let recovered = test_alert(
            AlertSeverity::Info,
            Some(HealthState::Unhealthy),
            HealthState::Running,
        );
        assert!(recovered.text().starts_with("[INFO]"));
        assert!(recovered.text().contains("recovered: now running (was unhealthy)"));

        let mut removed = test_alert(
            AlertSeverity::Info,
            Some(HealthState::Running),
            HealthState::Deleted,
        );
        removed.source = SourceKind::Kubernetes;
        removed.identity = WorkloadIdentity::pod("default", "web-0");
        assert_eq!(removed.text(), "[INFO] pod default/web-0 was removed");
    }

    #[tokio::test]
    async fn test_webhook_posts_text_payload() {
        let mut server = mockito::Server::new_async().await;
        let alert = test_alert(
            AlertSeverity::Critical,
            Some(HealthState::Running),
            HealthState::Unhealthy,
        );

        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({ "text": alert.text() })))
            .with_status(200)
            .create_async()
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.url()), Duration::from_secs(5)).unwrap();
        notifier.send(&alert).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_delivery_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.url()), Duration::from_secs(5)).unwrap();
        let err = notifier
            .send(&test_alert(AlertSeverity::Info, None, HealthState::Deleted))
            .await
            .unwrap_err();

        assert_eq!(err.sink, "webhook");
        assert!(err.reason.contains("500"));
    }

    #[tokio::test]
    async fn test_slack_uses_bearer_token_and_channel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat.postMessage")
            .match_header("authorization", "Bearer xoxb-test")
            .match_body(Matcher::PartialJson(serde_json::json!({ "channel": "#alerts" })))
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let notifier = SlackNotifier::new(
            format!("{}/api/chat.postMessage", server.url()),
            "#alerts",
            "xoxb-test",
            Duration::from_secs(5),
        )
        .unwrap();
        notifier
            .send(&test_alert(
                AlertSeverity::Critical,
                Some(HealthState::Running),
                HealthState::Failed,
            ))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slack_not_ok_is_delivery_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat.postMessage")
            .with_status(200)
            .with_body(r#"{"ok": false, "error": "channel_not_found"}"#)
            .create_async()
            .await;

        let notifier = SlackNotifier::new(
            format!("{}/api/chat.postMessage", server.url()),
            "#missing",
            "xoxb-test",
            Duration::from_secs(5),
        )
        .unwrap();
        let err = notifier
            .send(&test_alert(AlertSeverity::Info, None, HealthState::Deleted))
            .await
            .unwrap_err();

        assert_eq!(err.reason, "channel_not_found");
    }

    #[tokio::test]
    async fn test_deliver_retries_once() {
        let alert = test_alert(AlertSeverity::Info, None, HealthState::Deleted);

        let flaky = FlakyNotifier::new(1);
        let (attempts, result) = deliver(&flaky, &alert, true).await;
        assert!(result.is_ok());
        assert_eq!(attempts, 2);

        let broken = FlakyNotifier::new(5);
        let (attempts, result) = deliver(&broken, &alert, true).await;
        assert!(result.is_err());
        assert_eq!(attempts, 2);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);

        let no_retry = FlakyNotifier::new(1);
        let (attempts, result) = deliver(&no_retry, &alert, false).await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_build_notifier_selection() {
        let log = build_notifier(&NotifierConfig::default()).unwrap();
        assert_eq!(log.name(), "log");

        let slack = build_notifier(&NotifierConfig {
            slack_token: Some("xoxb-test".to_string()),
            ..NotifierConfig::default()
        })
        .unwrap();
        assert_eq!(slack.name(), "slack");

        let webhook = build_notifier(&NotifierConfig {
            webhook_url: Some("http://localhost:9/hook".to_string()),
            slack_token: Some("xoxb-test".to_string()),
            ..NotifierConfig::default()
        })
        .unwrap();
        assert_eq!(webhook.name(), "webhook");
    }

    #[tokio::test]
    async fn test_queue_full_drops() {
        let (queue, mut rx) = AlertQueue::new(1);
        let alert = test_alert(AlertSeverity::Info, None, HealthState::Deleted);

        assert!(queue.enqueue(alert.clone()));
        assert!(!queue.enqueue(alert.clone()));
        assert_eq!(rx.recv().await, Some(alert));
    }

    #[tokio::test]
    async fn test_worker_failure_degrades_notifier_health() {
        let health = HealthRegistry::new();
        health.register(components::NOTIFIER).await;

        let (queue, rx) = AlertQueue::new(8);
        let worker = NotifierWorker::new(
            Arc::new(FlakyNotifier::new(10)),
            rx,
            true,
            health.clone(),
            StructuredLogger::new("test-node"),
        );

        queue.enqueue(test_alert(
            AlertSeverity::Critical,
            Some(HealthState::Running),
            HealthState::Unhealthy,
        ));
        drop(queue);
        worker.run().await;

        let report = health.health().await;
        assert_eq!(
            report.components[components::NOTIFIER].status,
            crate::health::ComponentStatus::Degraded
        );
    }
}
