//! Local Docker driver: one container per issue.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions,
};

use super::{
    DiscoveredUnit, HealthProbe, LABEL_ISSUE_ID, LABEL_MANAGED, UNIT_SOURCE_DIR, UNIT_STATE_DIR,
    UnitDriver, UnitSpec, WORKER_PORT,
};
use crate::config::{BackendKind, DockerSection};

/// Docker container names allow more, but DNS labels cap at 63.
const MAX_NAME_LEN: usize = 63;

pub struct DockerDriver {
    docker: Docker,
    config: DockerSection,
    probe: HealthProbe,
}

impl DockerDriver {
    pub fn connect(config: DockerSection, probe: HealthProbe) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            config,
            probe,
        })
    }

    fn create_body(&self, spec: &UnitSpec) -> Result<ContainerCreateBody> {
        let port_key = format!("{}/tcp", WORKER_PORT);
        let port_bindings = HashMap::from([(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some(self.config.host.clone()),
                host_port: None,
            }]),
        )]);

        let host_config = HostConfig {
            binds: Some(binds(spec)),
            port_bindings: Some(port_bindings),
            memory: Some(parse_memory(&self.config.memory)?),
            nano_cpus: Some((self.config.cpus * 1e9) as i64),
            network_mode: self.config.network.clone(),
            ..Default::default()
        };

        let labels = HashMap::from([
            (LABEL_ISSUE_ID.to_string(), spec.issue_id.clone()),
            (LABEL_MANAGED.to_string(), "true".to_string()),
        ]);

        Ok(ContainerCreateBody {
            image: Some(self.config.image.clone()),
            env: Some(env_list(spec)),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }
}

#[async_trait]
impl UnitDriver for DockerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn max_name_len(&self) -> usize {
        MAX_NAME_LEN
    }

    async fn find(&self, name: &str) -> Result<Option<DiscoveredUnit>> {
        let Some(info) = self.inspect(name).await? else {
            return Ok(None);
        };
        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        Ok(Some(DiscoveredUnit {
            name: name.to_string(),
            endpoint_url: published_endpoint(&info, &self.config.host),
            running,
        }))
    }

    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        let body = self.create_body(spec)?;
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        self.docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", spec.name))?;

        // The host port is assigned on start.
        let info = self
            .inspect(&spec.name)
            .await?
            .with_context(|| format!("Container {} vanished after start", spec.name))?;
        published_endpoint(&info, &self.config.host)
            .with_context(|| format!("Container {} has no published worker port", spec.name))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", name)),
        }
    }

    async fn probe(&self, endpoint: &str) -> bool {
        self.probe.check(endpoint).await
    }
}

fn binds(spec: &UnitSpec) -> Vec<String> {
    vec![
        format!(
            "{}:{}",
            spec.workspace.claude_state_path.display(),
            UNIT_STATE_DIR
        ),
        format!("{}:{}", spec.workspace.source_path.display(), UNIT_SOURCE_DIR),
    ]
}

fn env_list(spec: &UnitSpec) -> Vec<String> {
    spec.env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

/// Host endpoint for the published worker port, if any.
fn published_endpoint(info: &ContainerInspectResponse, host: &str) -> Option<String> {
    let key = format!("{}/tcp", WORKER_PORT);
    let bindings = info
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&key)?
        .as_ref()?;
    let port = bindings.iter().find_map(|b| b.host_port.clone())?;
    if port.is_empty() {
        return None;
    }
    Some(format!("http://{}:{}", host, port))
}

/// Parse a Docker-style memory limit such as `4g`, `512m` or `1073741824`.
pub fn parse_memory(value: &str) -> Result<i64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1i64 << 10),
        Some('m') => (&value[..value.len() - 1], 1i64 << 20),
        Some('g') => (&value[..value.len() - 1], 1i64 << 30),
        Some('t') => (&value[..value.len() - 1], 1i64 << 40),
        _ => (value, 1),
    };
    let amount: f64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Invalid memory limit '{}'", value))?;
    if amount <= 0.0 {
        anyhow::bail!("Memory limit must be positive, got '{}'", value);
    }
    Ok((amount * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::workspace;
    use bollard::models::NetworkSettings;
    use std::collections::BTreeMap;

    fn spec() -> UnitSpec {
        UnitSpec {
            issue_id: "42".into(),
            name: "unit-issue-42".into(),
            workspace: workspace("42"),
            env: BTreeMap::from([
                ("ISSUE_ID".to_string(), "42".to_string()),
                ("PORT".to_string(), "8080".to_string()),
            ]),
        }
    }

    #[test]
    fn memory_limits() {
        assert_eq!(parse_memory("4g").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0g").is_err());
    }

    #[test]
    fn binds_mount_state_and_source() {
        let binds = binds(&spec());
        assert_eq!(binds[0], "/tmp/state:/home/agent/.claude");
        assert_eq!(binds[1], "/tmp/src:/workspace");
    }

    #[test]
    fn env_is_key_value_pairs() {
        assert_eq!(env_list(&spec()), vec!["ISSUE_ID=42", "PORT=8080"]);
    }

    #[test]
    fn endpoint_comes_from_published_port() {
        let mut ports = HashMap::new();
        ports.insert(
            "8080/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".into()),
                host_port: Some("49153".into()),
            }]),
        );
        let info = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            published_endpoint(&info, "127.0.0.1").as_deref(),
            Some("http://127.0.0.1:49153")
        );
        assert!(published_endpoint(&ContainerInspectResponse::default(), "127.0.0.1").is_none());
    }
}
