use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
    /// Drive the `claude` CLI.
    Claude,
    /// Deterministic echo runtime for dry-runs.
    Scripted,
}

/// Worker settings. Everything comes from the environment the compute unit
/// was started with; flags exist for local runs.
#[derive(Debug, Clone, Parser)]
#[command(name = "agentdock-worker", version, about = "Agent session worker for one issue")]
pub struct WorkerConfig {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "ISSUE_ID", default_value = "")]
    pub issue_id: String,

    #[arg(long, env = "PROJECT_ID", default_value = "")]
    pub project_id: String,

    #[arg(long, env = "PROJECT_NAME", default_value = "")]
    pub project_name: String,

    #[arg(long, env = "WORKING_DIRECTORY", default_value = "/workspace")]
    pub working_directory: PathBuf,

    #[arg(long, env = "CLAUDE_CONFIG_DIR", default_value = "/home/agent/.claude")]
    pub claude_config_dir: PathBuf,

    /// Defaults to `$CLAUDE_CONFIG_DIR/message-cache`.
    #[arg(long, env = "MESSAGE_CACHE_DIR")]
    pub message_cache_dir: Option<PathBuf>,

    #[arg(long, env = "CLAUDE_CMD", default_value = "claude")]
    pub claude_cmd: String,

    #[arg(long, env = "AGENT_RUNTIME", value_enum, default_value_t = RuntimeKind::Claude)]
    pub runtime: RuntimeKind,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl WorkerConfig {
    pub fn message_cache_dir(&self) -> PathBuf {
        self.message_cache_dir
            .clone()
            .unwrap_or_else(|| self.claude_config_dir.join("message-cache"))
    }

    /// Config for in-process tests and embedding.
    pub fn local(working_directory: impl Into<PathBuf>, claude_config_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 0,
            issue_id: String::new(),
            project_id: String::new(),
            project_name: String::new(),
            working_directory: working_directory.into(),
            claude_config_dir: claude_config_dir.into(),
            message_cache_dir: None,
            claude_cmd: "claude".to_string(),
            runtime: RuntimeKind::Scripted,
            log_json: false,
        }
    }
}
