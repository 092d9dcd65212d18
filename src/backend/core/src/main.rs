//! Confluence Server - Main entry point

use std::sync::Arc;
use std::time::Duration;

use confluence_core::{
    api::{self, AppState},
    config::Config,
    observability,
    runtime::SyncRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    observability::init("confluence-server", &config.observability)?;
    let metrics = observability::metrics::install_prometheus("confluence-server")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Confluence Server");

    let addr = config.bind_address();
    let runtime = Arc::new(SyncRuntime::build(config).await?);
    runtime.start();

    let app = api::build_router(AppState::new(runtime.clone()).with_metrics(metrics));

    tracing::info!(address = %addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown(Duration::from_secs(10)).await;
    observability::shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
