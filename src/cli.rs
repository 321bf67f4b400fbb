//! Command-line interface.
//!
//! Without a subcommand the binary runs the MCP server on stdio. The
//! subcommands answer one query against the same cache and exit, which is
//! handy for inspecting the store or warming an area by hand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::server::{handle_tool_call, SharedState};
use crate::storage::Storage;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Always refresh with synthetic data
    #[arg(long, global = true, conflicts_with = "live")]
    pub synthetic: bool,

    /// Refresh from Azure Maps when a subscription key is configured
    #[arg(long, global = true)]
    pub live: bool,

    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long, global = true, value_name = "path")]
    pub database: Option<PathBuf>,

    /// Seed for synthetic data (overrides SYNTHETIC_SEED)
    #[arg(long, global = true, value_name = "int")]
    pub seed: Option<u64>,
}

impl Cli {
    /// Apply command-line overrides on top of the environment configuration.
    pub fn apply(&self, config: &mut Config) {
        if self.synthetic {
            config.cache.use_synthetic_data = true;
        }
        if self.live {
            config.cache.use_synthetic_data = false;
        }
        if let Some(path) = &self.database {
            config.database.path = path.clone();
        }
        if let Some(seed) = self.seed {
            config.cache.synthetic_seed = Some(seed);
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show stored record counts and the active cache policy
    Stats,

    /// Print the traffic picture for an area
    Traffic {
        /// bounding box: lat1,lon1,lat2,lon2
        #[arg(long, value_name = "float", value_delimiter = ',', allow_hyphen_values = true)]
        bbox: Vec<f64>,

        /// Refresh the area even if stored data is fresh
        #[arg(long)]
        refresh: bool,
    },

    /// Print the incidents for an area
    Events {
        /// bounding box: lat1,lon1,lat2,lon2
        #[arg(long, value_name = "float", value_delimiter = ',', allow_hyphen_values = true)]
        bbox: Vec<f64>,

        /// Only incidents of this type, e.g. Accident
        #[arg(long)]
        event_type: Option<String>,

        /// Only incidents of this severity, e.g. Major
        #[arg(long)]
        severity: Option<String>,
    },

    /// Print incidents recorded anywhere in the last N hours
    Recent {
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a one-shot CLI command.
pub async fn execute_command(command: Commands, state: &SharedState) -> CliResult {
    match command {
        Commands::Stats => execute_stats(state).await,
        Commands::Traffic { bbox, refresh } => {
            let tool = if refresh { "traffic_refresh" } else { "traffic_area" };
            run_tool(state, tool, area_arguments(&bbox)).await
        }
        Commands::Events {
            bbox,
            event_type,
            severity,
        } => {
            let mut arguments = area_arguments(&bbox);
            if let Some(event_type) = event_type {
                arguments["event_type"] = json!(event_type);
            }
            if let Some(severity) = severity {
                arguments["severity"] = json!(severity);
            }
            run_tool(state, "events_area", arguments).await
        }
        Commands::Recent { hours } => run_tool(state, "events_recent", json!({ "hours": hours })).await,
    }
}

fn area_arguments(bbox: &[f64]) -> Value {
    match bbox {
        [lat1, lon1, lat2, lon2] => json!({
            "lat1": lat1,
            "lon1": lon1,
            "lat2": lat2,
            "lon2": lon2,
            "caller_id": "cli"
        }),
        // Incomplete boxes are rejected by the tool's argument validation.
        _ => json!({ "caller_id": "cli" }),
    }
}

async fn run_tool(state: &SharedState, tool: &str, arguments: Value) -> CliResult {
    match handle_tool_call(state, tool, Some(arguments), &CancellationToken::new()).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(text) => CliResult::success(text),
            Err(e) => CliResult::error(format!("Failed to format result: {}", e)),
        },
        Err(e) => CliResult::error(format!("Error: {}", e)),
    }
}

async fn execute_stats(state: &SharedState) -> CliResult {
    let storage = state.cache.storage();
    let flows = match storage.count_flows().await {
        Ok(n) => n,
        Err(e) => return CliResult::error(format!("Failed to count flow records: {}", e)),
    };
    let incidents = match storage.count_incidents().await {
        Ok(n) => n,
        Err(e) => return CliResult::error(format!("Failed to count incidents: {}", e)),
    };

    let cache = state.cache.config();
    let mut output = String::new();
    output.push_str("\nTraffic Cache Status\n");
    output.push_str("════════════════════════════════════════\n\n");
    output.push_str(&format!("Database:          {}\n", state.config.database.path.display()));
    output.push_str(&format!("Flow records:      {}\n", flows));
    output.push_str(&format!("Incident events:   {}\n", incidents));
    output.push_str(&format!("Provider:          {}\n", state.cache.provider_name()));
    output.push_str(&format!(
        "Synthetic mode:    {}\n",
        if cache.use_synthetic_data { "on" } else { "off" }
    ));
    output.push_str(&format!(
        "Freshness window:  {} min\n",
        cache.freshness_window.num_minutes()
    ));

    CliResult::success(output)
}
