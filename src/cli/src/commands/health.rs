//! Health check command.
//!
//! Queries the `/health` endpoint and displays component status.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include per-component counters
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: Value = client.get_raw("/health").await?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&health, format);
    }

    let status = health.get("status").and_then(Value::as_str).unwrap_or("unknown");
    let components = health.get("components").cloned().unwrap_or(Value::Null);

    output::print_header("Sync Core Health");
    output::print_detail("Status", &output::paint_state(status));
    output::print_detail("API URL", client.base_url());
    output::print_detail("Version", &output::field(&health, "version"));
    output::print_detail("Timestamp", &output::field(&health, "timestamp"));

    if let Some(store) = components.get("eventStore") {
        output::print_detail(
            "Event store",
            &format!("{} ({} events)", output::field(store, "backend"), output::field(store, "events")),
        );
    }

    let tripped: Vec<&str> = components
        .get("trippedBreakers")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !tripped.is_empty() {
        output::print_detail("Tripped breakers", &tripped.join(", "));
    }

    if args.detailed {
        output::print_header("Components");
        for key in ["bus", "sync", "conflicts"] {
            if let Some(stats) = components.get(key).and_then(Value::as_object) {
                let summary: Vec<String> = stats
                    .iter()
                    .filter(|(_, v)| v.is_number())
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                output::print_detail(key, &summary.join(" "));
            }
        }
    }

    match status {
        "healthy" => output::print_success("All systems operational"),
        "degraded" => output::print_warning("Serving with one or more dependencies isolated"),
        other => output::print_error(&format!("System status: {}", other)),
    }
    Ok(())
}
