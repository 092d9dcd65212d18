//! Saga inspection and control.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum SagaCommands {
    /// List saga instances with per-type stats
    List {
        /// Filter by status (running, completed, failed, compensated)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one saga instance
    Show {
        saga_id: Uuid,
    },

    /// Start a saga of a registered type and wait for it to finish
    Start {
        /// Registered saga type, e.g. COURSE_PURCHASE
        saga_type: String,

        /// Saga input as a JSON object
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Request cancellation of a running saga
    Cancel {
        saga_id: Uuid,
    },
}

#[derive(Tabled)]
struct SagaRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    saga_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Steps Done")]
    steps: usize,
    #[tabled(rename = "Failed Step")]
    failed_step: String,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

impl From<&Value> for SagaRow {
    fn from(s: &Value) -> Self {
        Self {
            id: output::field(s, "id"),
            saga_type: output::field(s, "saga_type"),
            status: output::paint_state(&output::field(s, "status")),
            steps: s.get("completed_steps").and_then(Value::as_array).map_or(0, Vec::len),
            failed_step: output::field(s, "failed_step"),
            updated_at: output::field(s, "updated_at"),
        }
    }
}

fn print_instance(instance: &Value, format: OutputFormat) -> Result<()> {
    if !matches!(format, OutputFormat::Table) {
        return output::print_item(instance, format);
    }
    output::print_header("Saga");
    for (label, key) in [
        ("ID", "id"),
        ("Type", "saga_type"),
        ("Failed step", "failed_step"),
        ("Last error", "last_error"),
        ("Created", "created_at"),
        ("Completed", "completed_at"),
    ] {
        output::print_detail(label, &output::field(instance, key));
    }
    output::print_detail("Status", &output::paint_state(&output::field(instance, "status")));

    if let Some(errors) = instance.get("compensation_errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            output::print_warning(&format!("{} compensation(s) failed; manual remediation required", errors.len()));
            for e in errors {
                output::print_detail(&output::field(e, "step"), &output::field(e, "error"));
            }
        }
    }
    Ok(())
}

pub async fn execute(cmd: SagaCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        SagaCommands::List { status } => {
            let path = match status {
                Some(s) => format!("/api/v1/sagas?status={}", s),
                None => "/api/v1/sagas".to_string(),
            };
            let body: Value = client.get(&path).await?;
            let instances = body.get("instances").and_then(Value::as_array).cloned().unwrap_or_default();
            let rows: Vec<SagaRow> = instances.iter().map(SagaRow::from).collect();
            match format {
                OutputFormat::Table => output::print_list(&rows, &instances, format),
                _ => output::print_item(&body, format),
            }
        }

        SagaCommands::Show { saga_id } => {
            let instance: Value = client.get(&format!("/api/v1/sagas/{}", saga_id)).await?;
            print_instance(&instance, format)
        }

        SagaCommands::Start { saga_type, data } => {
            let data: Value = serde_json::from_str(&data).context("--data must be valid JSON")?;
            let instance: Value = client
                .post("/api/v1/sagas", &json!({ "sagaType": saga_type, "data": data }))
                .await?;
            print_instance(&instance, format)
        }

        SagaCommands::Cancel { saga_id } => {
            let body: Value = client
                .post(&format!("/api/v1/sagas/{}/cancel", saga_id), &json!({}))
                .await?;
            match format {
                OutputFormat::Table => {
                    if body.get("cancelled").and_then(Value::as_bool).unwrap_or(false) {
                        output::print_success(&format!("Cancellation requested for saga {}", saga_id));
                    } else {
                        output::print_info(&format!("Saga {} had already finished", saga_id));
                    }
                    Ok(())
                }
                _ => output::print_item(&body, format),
            }
        }
    }
}
