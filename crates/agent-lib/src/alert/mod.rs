//! Alerting on workload state transitions
//!
//! This module provides:
//! - A pure policy mapping transitions to alert decisions
//! - Alert sinks (webhook, Slack chat API, log-only)
//! - A delivery worker that runs independently of ingestion

mod notifier;
mod policy;

pub use notifier::{
    build_notifier, deliver, Alert, AlertQueue, LogNotifier, Notifier, NotifierConfig,
    NotifierWorker, SlackNotifier, WebhookNotifier, SLACK_POST_MESSAGE_URL,
};
pub use policy::{AlertDecision, AlertPolicy, AlertSeverity};
