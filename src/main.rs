use anyhow::Result;
use agentdock::config::{BackendKind, Config, DEFAULT_CONFIG_FILE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agentdock")]
#[command(version, about = "Per-issue AI agent sessions in isolated compute units")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "AGENTDOCK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator HTTP API
    Serve {
        /// Address to bind (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Compute backend: docker, cloud
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Enable permissive CORS for browser clients
        #[arg(long)]
        cors: bool,
    },
    /// Inspect or stop an issue's compute unit
    Unit {
        #[command(subcommand)]
        command: UnitCommands,
    },
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum UnitCommands {
    /// Report whether the issue's unit is running and healthy
    Status { issue_id: String },
    /// Destroy the issue's unit
    Stop { issue_id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets redacted
    Show,
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            backend,
            cors,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            config.server.cors |= cors;

            let json = cli.log_json || config.logging.json;
            let _guard = agentdock::logging::init(&config.logging, json)?;
            cmd::cmd_serve(config).await?;
        }
        Commands::Unit { command } => {
            let _guard = agentdock::logging::init(&config.logging, cli.log_json)?;
            cmd::cmd_unit(&config, command).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli.config, &config, command)?;
        }
    }

    Ok(())
}
