//! Workload Sentinel CLI
//!
//! A command-line tool for inspecting a running sentinel agent: the
//! workloads it tracks and its own health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, workloads};

/// Workload Sentinel CLI
#[derive(Parser)]
#[command(name = "sentinelctl")]
#[command(author, version, about = "CLI for Workload Sentinel", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via SENTINEL_API_URL env var)
    #[arg(long, env = "SENTINEL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List tracked workloads
    Workloads {
        /// Filter by state (running, stopped, unhealthy, failed, pending, unknown)
        #[arg(long)]
        state: Option<String>,

        /// Filter by host (Docker) or namespace (Kubernetes)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Show agent health and readiness
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Workloads { state, scope } => {
            workloads::list_workloads(&client, state, scope, cli.format).await?;
        }
        Commands::Health => {
            health::show_health(&client, cli.format).await?;
        }
    }

    Ok(())
}
