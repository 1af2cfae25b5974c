//! Agent configuration

use agent_lib::alert::NotifierConfig;
use agent_lib::SourceKind;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use url::Url;

/// Env var naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "SENTINEL_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Which workload source to monitor
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Node or host name used in logs and Docker labels
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Docker enumeration interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum time between two alerts for one workload
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// How long a container may be missing from listings before it is dropped
    #[serde(default = "default_absence_timeout")]
    pub absence_timeout_secs: u64,

    /// Webhook receiving `{"text": ...}` alerts
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_slack_channel")]
    pub slack_channel: String,

    /// Name of the env var holding the Slack bot token
    #[serde(default = "default_slack_token_env")]
    pub slack_token_env: String,

    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,

    /// Retry a failed delivery once
    #[serde(default = "default_true")]
    pub notify_retry: bool,

    /// Explicit kubeconfig; in-cluster config is tried first otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Restrict the pod watch to one namespace
    #[serde(default)]
    pub watch_namespace: Option<String>,

    #[serde(default)]
    pub remediation_enabled: bool,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_alert_queue_size")]
    pub alert_queue_size: usize,

    /// Upper bound on the shutdown drain
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_source() -> SourceKind {
    SourceKind::Docker
}

fn default_node_name() -> String {
    resolve_node_name(std::env::var("NODE_NAME").ok())
}

/// `NODE_NAME` if set, else the OS hostname, else `unknown`
fn resolve_node_name(from_env: Option<String>) -> String {
    from_env
        .filter(|name| !name.trim().is_empty())
        .or_else(System::host_name)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    60
}

fn default_absence_timeout() -> u64 {
    90
}

fn default_slack_channel() -> String {
    "#alerts".to_string()
}

fn default_slack_token_env() -> String {
    "SLACK_TOKEN".to_string()
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_backoff_initial() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    300
}

fn default_alert_queue_size() -> usize {
    256
}

fn default_shutdown_grace() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from an optional file and `SENTINEL_*` env vars
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("SENTINEL").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        Self::from_config(config)
    }

    /// Deserialize and validate an already assembled configuration
    pub fn from_config(config: config::Config) -> Result<Self> {
        let parsed: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            bail!("node_name must not be empty");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.notify_timeout_secs == 0 {
            bail!("notify_timeout_secs must be greater than zero");
        }
        if self.backoff_initial_secs == 0 {
            bail!("backoff_initial_secs must be greater than zero");
        }
        if self.backoff_initial_secs > self.backoff_max_secs {
            bail!(
                "backoff_initial_secs ({}) exceeds backoff_max_secs ({})",
                self.backoff_initial_secs,
                self.backoff_max_secs
            );
        }
        if self.alert_queue_size == 0 {
            bail!("alert_queue_size must be greater than zero");
        }
        if let Some(webhook) = self.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            let url = Url::parse(webhook)
                .with_context(|| format!("Invalid webhook_url: {}", webhook))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("webhook_url must use http or https, got {}", url.scheme());
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn absence_timeout(&self) -> Duration {
        Duration::from_secs(self.absence_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Sink settings, with the Slack token read from its env var
    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            webhook_url: self.webhook_url.clone().filter(|u| !u.is_empty()),
            slack_channel: self.slack_channel.clone(),
            slack_token: std::env::var(&self.slack_token_env)
                .ok()
                .filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(self.notify_timeout_secs),
            ..NotifierConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(overrides: &[(&str, &str)]) -> Result<AgentConfig> {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        AgentConfig::from_config(builder.build()?)
    }

    #[test]
    fn test_defaults() {
        let config = build(&[("node_name", "host-1")]).unwrap();

        assert_eq!(config.source, SourceKind::Docker);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert_eq!(config.absence_timeout(), Duration::from_secs(90));
        assert_eq!(config.slack_channel, "#alerts");
        assert_eq!(config.slack_token_env, "SLACK_TOKEN");
        assert!(config.notify_retry);
        assert!(!config.remediation_enabled);
        assert_eq!(config.backoff_initial_secs, 1);
        assert_eq!(config.backoff_max_secs, 300);
        assert_eq!(config.alert_queue_size, 256);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_node_name_falls_back_to_os_hostname() {
        assert_eq!(resolve_node_name(Some("node-a".to_string())), "node-a");

        let fallback = resolve_node_name(None);
        assert_ne!(fallback, "unknown");
        assert_eq!(resolve_node_name(Some("  ".to_string())), fallback);
    }

    #[test]
    fn test_overrides() {
        let config = build(&[
            ("node_name", "host-1"),
            ("source", "kubernetes"),
            ("poll_interval_secs", "5"),
            ("webhook_url", "https://hooks.example.com/T000"),
            ("remediation_enabled", "true"),
        ])
        .unwrap();

        assert_eq!(config.source, SourceKind::Kubernetes);
        assert_eq!(config.poll_interval_secs, 5);
        assert!(config.remediation_enabled);
        assert_eq!(
            config.notifier_config().webhook_url.as_deref(),
            Some("https://hooks.example.com/T000")
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(build(&[("node_name", "host-1"), ("poll_interval_secs", "0")]).is_err());
        assert!(build(&[("node_name", "host-1"), ("source", "podman")]).is_err());
        assert!(build(&[("node_name", "host-1"), ("webhook_url", "not a url")]).is_err());
        assert!(build(&[("node_name", "host-1"), ("webhook_url", "ftp://example.com")]).is_err());
        assert!(build(&[
            ("node_name", "host-1"),
            ("backoff_initial_secs", "600"),
            ("backoff_max_secs", "300"),
        ])
        .is_err());
    }

    #[test]
    fn test_slack_token_read_from_named_env_var() {
        std::env::set_var("SENTINEL_TEST_SLACK_TOKEN", "xoxb-test");
        let config = build(&[
            ("node_name", "host-1"),
            ("slack_token_env", "SENTINEL_TEST_SLACK_TOKEN"),
        ])
        .unwrap();

        let notifier = config.notifier_config();
        assert_eq!(notifier.slack_token.as_deref(), Some("xoxb-test"));
        assert_eq!(notifier.slack_channel, "#alerts");
        std::env::remove_var("SENTINEL_TEST_SLACK_TOKEN");
    }
}
