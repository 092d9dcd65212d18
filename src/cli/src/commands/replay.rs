//! Replay stored events through current subscribers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::{json, Value};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct ReplayArgs {
    /// Inclusive start of the window (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Inclusive end of the window (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Only these event types
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,
}

pub async fn execute(args: ReplayArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    if let (Some(from), Some(to)) = (args.from, args.to) {
        anyhow::ensure!(from <= to, "--from must not be after --to");
    }

    let body = json!({ "from": args.from, "to": args.to, "eventTypes": args.types });
    let report: Value = client.post("/api/v1/replay", &body).await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!(
                "Replayed {} event(s), {} subscriber deliveries queued",
                output::field(&report, "replayed"),
                output::field(&report, "deliveries")
            ));
            Ok(())
        }
        _ => output::print_item(&report, format),
    }
}
