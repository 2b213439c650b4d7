use std::sync::Arc;

use agentdock_worker::{WorkerConfig, WorkerState, server};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down worker");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::parse();
    init_tracing(config.log_json);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        issue_id = %config.issue_id,
        runtime = ?config.runtime,
        "Worker listening"
    );

    let state = Arc::new(WorkerState::from_config(config));
    server::serve(listener, state, shutdown_signal()).await
}
