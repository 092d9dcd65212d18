//! Confluence CLI - operator tool for the sync core.
//!
//! Inspects health, breakers, sagas, conflicts and strangler routes, and
//! triggers event replay.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{breakers, config, conflicts, health, replay, routes, sagas};
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "confluence",
    version,
    about = "Confluence - legacy/modern sync core",
    long_about = "Operator CLI for the Confluence sync core: health, circuit breakers, sagas, conflicts, strangler routes and event replay.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "CONFLUENCE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check sync core health
    Health(health::HealthArgs),

    /// Circuit breaker state per dependency
    Breakers,

    /// Saga inspection and control
    #[command(subcommand)]
    Sagas(sagas::SagaCommands),

    /// Conflict stats and recent resolutions
    Conflicts(conflicts::ConflictArgs),

    /// Strangler route status and migration
    #[command(subcommand)]
    Routes(routes::RouteCommands),

    /// Replay stored events in a time window
    Replay(replay::ReplayArgs),

    /// CLI configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Breakers => breakers::execute(&client, format).await,
        Commands::Sagas(cmd) => sagas::execute(cmd, &client, format).await,
        Commands::Conflicts(args) => conflicts::execute(args, &client, format).await,
        Commands::Routes(cmd) => routes::execute(cmd, &client, format).await,
        Commands::Replay(args) => replay::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_replay_parses_window_and_types() {
        let cli = Cli::try_parse_from([
            "confluence",
            "replay",
            "--from",
            "2026-01-01T00:00:00Z",
            "--to",
            "2026-01-02T00:00:00Z",
            "--types",
            "USER_UPDATED,TRADE_EXECUTED",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Replay(_)));
    }
}
