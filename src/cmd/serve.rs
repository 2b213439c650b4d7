//! `agentdock serve`: run the orchestrator API.

use anyhow::{Context, Result};
use agentdock::config::Config;

pub async fn cmd_serve(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    println!("agentdock running at http://{}", listener.local_addr()?);

    agentdock::server::serve(config, listener, agentdock::server::shutdown_signal()).await
}
