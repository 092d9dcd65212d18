//! Conflict statistics and recent resolutions.

use anyhow::Result;
use clap::Args;
use serde_json::Value;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ConflictArgs {
    /// Number of recent resolutions to show
    #[arg(short, long, default_value = "20")]
    limit: usize,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Type")]
    conflict_type: String,
    #[tabled(rename = "Fields")]
    fields: String,
    #[tabled(rename = "Strategies")]
    strategies: String,
    #[tabled(rename = "Resolved At")]
    resolved_at: String,
}

impl From<&Value> for ConflictRow {
    fn from(record: &Value) -> Self {
        let conflict = record.get("conflict").cloned().unwrap_or(Value::Null);
        let resolution = record.get("resolution").cloned().unwrap_or(Value::Null);

        let decisions = resolution.get("decisions").and_then(Value::as_array);
        let fields: Vec<String> = decisions
            .map(|d| d.iter().map(|x| output::field(x, "field")).collect())
            .unwrap_or_default();
        let mut strategies: Vec<String> = decisions
            .map(|d| d.iter().map(|x| output::field(x, "strategy")).collect())
            .unwrap_or_default();
        strategies.sort();
        strategies.dedup();

        Self {
            entity: format!("{}/{}", output::field(&conflict, "entity_type"), output::field(&conflict, "entity_id")),
            conflict_type: output::field(&conflict, "conflict_type"),
            fields: fields.join(", "),
            strategies: strategies.join(", "),
            resolved_at: output::field(&resolution, "resolved_at"),
        }
    }
}

pub async fn execute(args: ConflictArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let body: Value = client.get(&format!("/api/v1/conflicts?limit={}", args.limit)).await?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&body, format);
    }

    let stats = body.get("stats").cloned().unwrap_or(Value::Null);
    output::print_header("Conflicts");
    output::print_detail("Processed updates", &output::field(&stats, "processed_updates"));
    output::print_detail("Detected", &output::field(&stats, "conflicts_detected"));
    output::print_detail("Resolved", &output::field(&stats, "conflicts_resolved"));
    output::print_detail("Conflict rate", &output::field(&stats, "conflict_rate"));
    println!();

    let recent = body.get("recent").and_then(Value::as_array).cloned().unwrap_or_default();
    let rows: Vec<ConflictRow> = recent.iter().map(ConflictRow::from).collect();
    output::print_list(&rows, &recent, format)
}
