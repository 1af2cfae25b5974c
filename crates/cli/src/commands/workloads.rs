//! Tracked workload listing

use anyhow::Result;
use chrono::Utc;
use tabled::Tabled;

use crate::client::{ApiClient, Workload};
use crate::output::{color_status, format_age, print_warning, OutputFormat};

/// Row for the workloads table
#[derive(Tabled)]
struct WorkloadRow {
    #[tabled(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Previous")]
    previous: String,
    #[tabled(rename = "Changed")]
    changed: String,
    #[tabled(rename = "Last Alert")]
    last_alert: String,
}

/// Keep workloads whose scope (host or namespace) matches
fn filter_scope(workloads: Vec<Workload>, scope: Option<&str>) -> Vec<Workload> {
    match scope {
        Some(scope) => workloads.into_iter().filter(|w| w.scope == scope).collect(),
        None => workloads,
    }
}

/// List tracked workloads
pub async fn list_workloads(
    client: &ApiClient,
    state: Option<String>,
    scope: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let workloads = client.workloads(state.as_deref()).await?;
    let workloads = filter_scope(workloads, scope.as_deref());

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&workloads)?);
        }
        OutputFormat::Table => {
            if workloads.is_empty() {
                print_warning("No workloads tracked");
                return Ok(());
            }

            let now = Utc::now();
            let rows: Vec<WorkloadRow> = workloads
                .iter()
                .map(|w| WorkloadRow {
                    scope: w.scope.clone(),
                    name: w.name.clone(),
                    identity: w.identity.clone(),
                    state: color_status(&w.state),
                    previous: w.previous_state.clone().unwrap_or_else(|| "-".to_string()),
                    changed: format_age(&w.last_transition_at, now),
                    last_alert: w
                        .last_alert_sent_at
                        .as_deref()
                        .map(|ts| format_age(ts, now))
                        .unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!("\nTotal: {} workloads", workloads.len());
        }
    }

    Ok(())
}
