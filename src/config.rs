//! Orchestrator configuration.
//!
//! Resolution order: `agentdock.toml` (missing file means defaults), then
//! environment overrides, then CLI flags (applied by `main`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "agentdock.toml";
pub const DEFAULT_BOT_NAME: &str = "agentdock-bot";
pub const DEFAULT_BOT_EMAIL: &str = "agentdock-bot@users.noreply.github.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for browser clients on another origin.
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdock")
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Cloud => write!(f, "cloud"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "cloud" => Ok(BackendKind::Cloud),
            _ => anyhow::bail!("Invalid backend '{}'. Valid values: docker, cloud", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_provisioning_timeout")]
    pub provisioning_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub cloud: CloudSection,
}

fn default_provisioning_timeout() -> u64 {
    300
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_poll_interval() -> u64 {
    1000
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            provisioning_timeout_secs: default_provisioning_timeout(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            docker: DockerSection::default(),
            cloud: CloudSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default = "default_worker_image")]
    pub image: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_docker_memory")]
    pub memory: String,
    #[serde(default = "default_docker_cpus")]
    pub cpus: f64,
    /// Address published container ports are reachable on.
    #[serde(default = "default_docker_host")]
    pub host: String,
}

fn default_worker_image() -> String {
    "agentdock-worker:latest".to_string()
}

fn default_docker_memory() -> String {
    "4g".to_string()
}

fn default_docker_cpus() -> f64 {
    2.0
}

fn default_docker_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            image: default_worker_image(),
            network: None,
            memory: default_docker_memory(),
            cpus: default_docker_cpus(),
            host: default_docker_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSection {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_worker_image")]
    pub image: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Shared volume holding every issue's state and source directories.
    #[serde(default)]
    pub storage_volume: Option<String>,
    #[serde(default = "default_cloud_cpu")]
    pub cpu: f64,
    #[serde(default = "default_cloud_memory")]
    pub memory: String,
}

fn default_cloud_cpu() -> f64 {
    1.0
}

fn default_cloud_memory() -> String {
    "2Gi".to_string()
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            api_base: None,
            token: None,
            image: default_worker_image(),
            region: None,
            storage_volume: None,
            cpu: default_cloud_cpu(),
            memory: default_cloud_memory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSection {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    /// Branch the project clone follows when a start request names none.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_author_name() -> String {
    DEFAULT_BOT_NAME.to_string()
}

fn default_author_email() -> String {
    DEFAULT_BOT_EMAIL.to_string()
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
            default_branch: default_branch(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub github_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// Daily-rolled log files are written here when set.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agentdock.toml")
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load the file and apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(kind) = get("AGENTDOCK_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Some(root) = get("AGENTDOCK_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(token) = get("CLAUDE_CODE_OAUTH_TOKEN") {
            self.auth.oauth_token = Some(token);
        }
        if let Some(token) = get("GITHUB_TOKEN") {
            self.auth.github_token = Some(token);
        }
        if let Some(name) = get("GIT_AUTHOR_NAME") {
            self.git.author_name = name;
        }
        if let Some(email) = get("GIT_AUTHOR_EMAIL") {
            self.git.author_email = email;
        }
        if let Some(token) = get("AGENTDOCK_CLOUD_TOKEN") {
            self.backend.cloud.token = Some(token);
        }
        Ok(())
    }

    /// Pretty TOML with secrets replaced.
    pub fn redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        for secret in [
            &mut copy.auth.oauth_token,
            &mut copy.auth.github_token,
            &mut copy.backend.cloud.token,
        ] {
            if secret.is_some() {
                *secret = Some("***".to_string());
            }
        }
        toml::to_string_pretty(&copy).context("Failed to serialize configuration")
    }
}
