//! Strangler route inspection and migration control.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use serde_json::{json, Value};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Status {
    Legacy,
    Dual,
    Migrated,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Dual => "dual",
            Self::Migrated => "migrated",
        }
    }
}

#[derive(Subcommand)]
pub enum RouteCommands {
    /// List routes with migration status and traffic stats
    List,

    /// Change a route's migration status
    Set {
        /// Route name
        name: String,

        #[arg(short, long, value_enum)]
        status: Status,

        /// Percent of traffic sent to the modern side while dual
        #[arg(long)]
        split: Option<u8>,
    },
}

#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "Route")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Split %")]
    split: String,
    #[tabled(rename = "Legacy")]
    legacy_served: String,
    #[tabled(rename = "Modern")]
    modern_served: String,
    #[tabled(rename = "Fallbacks")]
    fallbacks: String,
    #[tabled(rename = "Failures")]
    failures: String,
}

impl From<&Value> for RouteRow {
    fn from(r: &Value) -> Self {
        let config = r.get("config").cloned().unwrap_or(Value::Null);
        let stats = r.get("stats").cloned().unwrap_or(Value::Null);
        Self {
            name: output::field(&config, "name"),
            status: output::paint_state(&output::field(&config, "status")),
            split: output::field(&config, "traffic_split_percent"),
            legacy_served: output::field(&stats, "legacy_served"),
            modern_served: output::field(&stats, "modern_served"),
            fallbacks: output::field(&stats, "fallbacks"),
            failures: output::field(&stats, "failures"),
        }
    }
}

pub async fn execute(cmd: RouteCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        RouteCommands::List => {
            let routes: Vec<Value> = client.get("/api/v1/routes").await?;
            let rows: Vec<RouteRow> = routes.iter().map(RouteRow::from).collect();
            output::print_list(&rows, &routes, format)
        }

        RouteCommands::Set { name, status, split } => {
            let body = json!({ "status": status.as_str(), "trafficSplitPercent": split });
            let config: Value = client.put(&format!("/api/v1/routes/{}", name), &body).await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!(
                        "{} is now {} (split {}%)",
                        name,
                        output::field(&config, "status"),
                        output::field(&config, "traffic_split_percent")
                    ));
                    Ok(())
                }
                _ => output::print_item(&config, format),
            }
        }
    }
}
