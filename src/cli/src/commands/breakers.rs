//! Circuit breaker state per dependency.

use anyhow::Result;
use serde_json::Value;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Tabled)]
struct BreakerRow {
    #[tabled(rename = "Dependency")]
    dependency: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Failures")]
    failures: String,
    #[tabled(rename = "Rejected")]
    rejected: String,
    #[tabled(rename = "Last Failure")]
    last_failure: String,
}

impl From<&Value> for BreakerRow {
    fn from(b: &Value) -> Self {
        Self {
            dependency: output::field(b, "dependency"),
            state: output::paint_state(&output::field(b, "state")),
            failures: format!("{}/{}", output::field(b, "failure_count"), output::field(b, "failure_threshold")),
            rejected: output::field(b, "total_rejections"),
            last_failure: output::field(b, "last_failure_time"),
        }
    }
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let breakers: Vec<Value> = client.get("/api/v1/breakers").await?;
    let rows: Vec<BreakerRow> = breakers.iter().map(BreakerRow::from).collect();
    output::print_list(&rows, &breakers, format)
}
