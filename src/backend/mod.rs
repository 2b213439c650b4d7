//! Compute backends: one isolated unit per issue.
//!
//! [`ComputeBackend`] is the lifecycle contract the execution service relies
//! on. [`ManagedBackend`] implements it once (tracking, per-issue locking,
//! health checks, rediscovery, provisioning wait) over a provider-specific
//! [`UnitDriver`]: [`docker::DockerDriver`] or [`cloud::CloudDriver`].

pub mod cloud;
pub mod docker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::{AuthSection, BackendKind, Config, GitSection};
use crate::errors::BackendError;
use crate::workspace::Workspace;

pub const UNIT_PREFIX: &str = "unit-issue-";
pub const WORKER_PORT: u16 = 8080;
/// In-unit mount point of the issue's source checkout.
pub const UNIT_SOURCE_DIR: &str = "/workspace";
/// In-unit mount point of the issue's agent state.
pub const UNIT_STATE_DIR: &str = "/home/agent/.claude";

pub const LABEL_ISSUE_ID: &str = "agentdock.issue-id";
pub const LABEL_MANAGED: &str = "agentdock.managed";

/// A live compute unit serving one issue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeUnit {
    pub issue_id: String,
    pub unit_id: String,
    pub endpoint_url: String,
    pub created_at: DateTime<Utc>,
    pub last_healthy_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Everything a driver needs to create a unit.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub issue_id: String,
    pub name: String,
    pub workspace: Workspace,
    pub env: BTreeMap<String, String>,
}

/// A unit as the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUnit {
    pub name: String,
    pub endpoint_url: Option<String>,
    pub running: bool,
}

/// Deterministic unit name for an issue.
///
/// `unit-issue-{slug}` where the slug keeps lowercase letters, digits and
/// single dashes. When the id had to be altered, or the name would exceed
/// `max_len`, an 8-hex sha256 suffix of the raw id keeps distinct ids apart.
pub fn unit_name(issue_id: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(issue_id.len());
    for c in issue_id.chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '-'
        };
        if c == '-' && (slug.is_empty() || slug.ends_with('-')) {
            continue;
        }
        slug.push(c);
    }
    let slug = slug.trim_end_matches('-');

    let plain = format!("{}{}", UNIT_PREFIX, slug);
    if slug == issue_id && plain.len() <= max_len {
        return plain;
    }

    let digest = format!("{:x}", Sha256::digest(issue_id.as_bytes()));
    let hash = &digest[..8];
    let room = max_len.saturating_sub(UNIT_PREFIX.len() + hash.len() + 1);
    let short = slug[..slug.len().min(room)].trim_end_matches('-');
    if short.is_empty() {
        format!("{}{}", UNIT_PREFIX, hash)
    } else {
        format!("{}{}-{}", UNIT_PREFIX, short, hash)
    }
}

/// Environment injected into every unit.
pub fn unit_env(
    workspace: &Workspace,
    project_name: &str,
    git: &GitSection,
    auth: &AuthSection,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("ISSUE_ID".into(), workspace.issue_id.clone());
    env.insert("PROJECT_ID".into(), workspace.project_id.clone());
    env.insert("PROJECT_NAME".into(), project_name.to_string());
    env.insert("WORKING_DIRECTORY".into(), UNIT_SOURCE_DIR.into());
    env.insert("CLAUDE_CONFIG_DIR".into(), UNIT_STATE_DIR.into());
    env.insert("PORT".into(), WORKER_PORT.to_string());
    env.insert("GIT_AUTHOR_NAME".into(), git.author_name.clone());
    env.insert("GIT_AUTHOR_EMAIL".into(), git.author_email.clone());
    env.insert("GIT_COMMITTER_NAME".into(), git.author_name.clone());
    env.insert("GIT_COMMITTER_EMAIL".into(), git.author_email.clone());
    if let Some(token) = &auth.oauth_token {
        env.insert("CLAUDE_CODE_OAUTH_TOKEN".into(), token.clone());
    }
    if let Some(token) = &auth.github_token {
        env.insert("GITHUB_TOKEN".into(), token.clone());
    }
    env
}

/// `GET {endpoint}/health` with a short timeout.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build health-check client")?;
        Ok(Self { client })
    }

    pub async fn check(&self, endpoint: &str) -> bool {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .map(|body| body["status"] == "ok")
                .unwrap_or(false),
            Ok(resp) => {
                tracing::debug!(%url, status = %resp.status(), "Health check failed");
                false
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "Health check failed");
                false
            }
        }
    }
}

/// Provider operations behind a [`ManagedBackend`].
#[async_trait]
pub trait UnitDriver: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Longest unit name the provider accepts.
    fn max_name_len(&self) -> usize;

    fn unit_name(&self, issue_id: &str) -> String {
        unit_name(issue_id, self.max_name_len())
    }

    /// Look up a unit by name; `None` when it does not exist.
    async fn find(&self, name: &str) -> anyhow::Result<Option<DiscoveredUnit>>;

    /// Create and start a unit, returning its endpoint once known.
    async fn create(&self, spec: &UnitSpec) -> anyhow::Result<String>;

    /// Destroy a unit. Destroying a missing unit succeeds.
    async fn destroy(&self, name: &str) -> anyhow::Result<()>;

    async fn probe(&self, endpoint: &str) -> bool;
}

/// Lifecycle contract for per-issue compute units.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Deterministic unit name for the issue.
    fn unit_name(&self, issue_id: &str) -> String;

    /// Return a healthy unit for the issue, creating or replacing it as needed.
    async fn ensure_running(
        &self,
        issue_id: &str,
        workspace: &Workspace,
        env: BTreeMap<String, String>,
    ) -> Result<ComputeUnit, BackendError>;

    /// Destroy the issue's unit. Stopping a stopped issue is a no-op.
    async fn stop(&self, issue_id: &str) -> Result<(), BackendError>;

    /// Issues whose unit has seen no activity for longer than `older_than`.
    async fn list_idle(&self, older_than: Duration) -> Vec<String>;

    /// Tracked unit, without probing.
    fn unit(&self, issue_id: &str) -> Option<ComputeUnit>;

    /// Whether a healthy unit exists, tracked or rediscovered by name.
    async fn is_running(&self, issue_id: &str) -> Result<bool, BackendError>;

    /// Record session activity on the issue's unit.
    fn touch(&self, issue_id: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct BackendTimings {
    pub provisioning_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BackendTimings {
    fn default() -> Self {
        Self {
            provisioning_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

pub struct ManagedBackend<D: UnitDriver> {
    driver: D,
    timings: BackendTimings,
    units: DashMap<String, ComputeUnit>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<D: UnitDriver> ManagedBackend<D> {
    pub fn new(driver: D, timings: BackendTimings) -> Self {
        Self {
            driver,
            timings,
            units: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn lock_for(&self, issue_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(issue_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the issue's lock entry unless another caller still holds it.
    fn release_lock(&self, issue_id: &str) {
        self.locks
            .remove_if(issue_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn track(&self, issue_id: &str, name: &str, endpoint: String, created_at: DateTime<Utc>) -> ComputeUnit {
        let now = Utc::now();
        let unit = ComputeUnit {
            issue_id: issue_id.to_string(),
            unit_id: name.to_string(),
            endpoint_url: endpoint,
            created_at,
            last_healthy_at: now,
            last_activity_at: now,
        };
        self.units.insert(issue_id.to_string(), unit.clone());
        unit
    }

    async fn wait_healthy(&self, endpoint: &str) -> bool {
        let poll = async {
            loop {
                if self.driver.probe(endpoint).await {
                    return;
                }
                tokio::time::sleep(self.timings.poll_interval).await;
            }
        };
        tokio::time::timeout(self.timings.provisioning_timeout, poll)
            .await
            .is_ok()
    }

    /// Adopt a unit left behind by an earlier process, if it is healthy.
    async fn rediscover(&self, issue_id: &str, name: &str) -> Result<Option<ComputeUnit>, BackendError> {
        let Some(found) = self.driver.find(name).await? else {
            return Ok(None);
        };
        if found.running
            && let Some(endpoint) = found.endpoint_url
            && self.driver.probe(&endpoint).await
        {
            tracing::info!(issue_id, unit = name, "Reusing existing compute unit");
            return Ok(Some(self.track(issue_id, name, endpoint, Utc::now())));
        }
        tracing::warn!(issue_id, unit = name, "Removing stale compute unit");
        self.driver.destroy(name).await?;
        Ok(None)
    }

    async fn provision(&self, spec: UnitSpec) -> Result<ComputeUnit, BackendError> {
        let failed = |reason: String| BackendError::Provisioning {
            issue_id: spec.issue_id.clone(),
            reason,
        };

        tracing::info!(issue_id = %spec.issue_id, unit = %spec.name, backend = %self.driver.kind(), "Creating compute unit");
        let endpoint = self
            .driver
            .create(&spec)
            .await
            .map_err(|e| failed(format!("{:#}", e)))?;

        if !self.wait_healthy(&endpoint).await {
            if let Err(e) = self.driver.destroy(&spec.name).await {
                tracing::warn!(unit = %spec.name, error = %e, "Failed to remove unit after provisioning timeout");
            }
            return Err(failed(format!(
                "not healthy after {}s",
                self.timings.provisioning_timeout.as_secs()
            )));
        }

        tracing::info!(issue_id = %spec.issue_id, unit = %spec.name, %endpoint, "Compute unit ready");
        Ok(self.track(&spec.issue_id, &spec.name, endpoint, Utc::now()))
    }
}

#[async_trait]
impl<D: UnitDriver> ComputeBackend for ManagedBackend<D> {
    fn kind(&self) -> BackendKind {
        self.driver.kind()
    }

    fn unit_name(&self, issue_id: &str) -> String {
        self.driver.unit_name(issue_id)
    }

    async fn ensure_running(
        &self,
        issue_id: &str,
        workspace: &Workspace,
        env: BTreeMap<String, String>,
    ) -> Result<ComputeUnit, BackendError> {
        let lock = self.lock_for(issue_id);
        let _guard = lock.lock().await;
        let name = self.driver.unit_name(issue_id);

        let tracked = self.units.get(issue_id).map(|u| u.clone());
        match tracked {
            Some(unit) => {
                if self.driver.probe(&unit.endpoint_url).await {
                    if let Some(mut entry) = self.units.get_mut(issue_id) {
                        entry.last_healthy_at = Utc::now();
                    }
                    return Ok(self.units.get(issue_id).map(|u| u.clone()).unwrap_or(unit));
                }
                let unhealthy = BackendError::Unhealthy {
                    unit: unit.unit_id.clone(),
                };
                tracing::warn!(issue_id, "{}; replacing it", unhealthy);
                self.units.remove(issue_id);
                if let Err(e) = self.driver.destroy(&name).await {
                    tracing::warn!(unit = %name, error = %e, "Failed to remove unhealthy unit");
                }
            }
            None => {
                if let Some(unit) = self.rediscover(issue_id, &name).await? {
                    return Ok(unit);
                }
            }
        }

        self.provision(UnitSpec {
            issue_id: issue_id.to_string(),
            name,
            workspace: workspace.clone(),
            env,
        })
        .await
    }

    async fn stop(&self, issue_id: &str) -> Result<(), BackendError> {
        let lock = self.lock_for(issue_id);
        let result = {
            let _guard = lock.lock().await;
            let name = self
                .units
                .remove(issue_id)
                .map(|(_, unit)| unit.unit_id)
                .unwrap_or_else(|| self.driver.unit_name(issue_id));
            self.driver.destroy(&name).await.map(|()| name)
        };
        drop(lock);
        self.release_lock(issue_id);

        let name = result?;
        tracing::info!(issue_id, unit = %name, "Compute unit stopped");
        Ok(())
    }

    async fn list_idle(&self, older_than: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        self.units
            .iter()
            .filter(|entry| now - entry.value().last_activity_at > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn unit(&self, issue_id: &str) -> Option<ComputeUnit> {
        self.units.get(issue_id).map(|u| u.clone())
    }

    async fn is_running(&self, issue_id: &str) -> Result<bool, BackendError> {
        if let Some(unit) = self.unit(issue_id) {
            return Ok(self.driver.probe(&unit.endpoint_url).await);
        }
        let name = self.driver.unit_name(issue_id);
        match self.driver.find(&name).await? {
            Some(DiscoveredUnit {
                running: true,
                endpoint_url: Some(endpoint),
                ..
            }) => Ok(self.driver.probe(&endpoint).await),
            _ => Ok(false),
        }
    }

    fn touch(&self, issue_id: &str) {
        if let Some(mut unit) = self.units.get_mut(issue_id) {
            unit.last_activity_at = Utc::now();
        }
    }
}

/// Backend selected by `[backend] kind`.
pub fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn ComputeBackend>> {
    let timings = BackendTimings {
        provisioning_timeout: Duration::from_secs(config.backend.provisioning_timeout_secs),
        poll_interval: Duration::from_millis(config.backend.health_poll_interval_ms),
    };
    let probe = HealthProbe::new(Duration::from_secs(config.backend.health_timeout_secs))?;

    let backend: Arc<dyn ComputeBackend> = match config.backend.kind {
        BackendKind::Docker => {
            let driver = docker::DockerDriver::connect(config.backend.docker.clone(), probe)?;
            Arc::new(ManagedBackend::new(driver, timings))
        }
        BackendKind::Cloud => {
            let driver = cloud::CloudDriver::new(config.backend.cloud.clone(), probe)?;
            Arc::new(ManagedBackend::new(driver, timings))
        }
    };
    Ok(backend)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory driver for lifecycle tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeDriver {
        pub creates: AtomicUsize,
        pub destroys: AtomicUsize,
        pub healthy: AtomicBool,
        pub fail_create: AtomicBool,
        pub existing: StdMutex<HashMap<String, String>>,
    }

    impl FakeDriver {
        pub fn healthy() -> Self {
            let driver = Self::default();
            driver.healthy.store(true, Ordering::SeqCst);
            driver
        }
    }

    #[async_trait]
    impl UnitDriver for FakeDriver {
        fn kind(&self) -> BackendKind {
            BackendKind::Docker
        }

        fn max_name_len(&self) -> usize {
            63
        }

        async fn find(&self, name: &str) -> anyhow::Result<Option<DiscoveredUnit>> {
            Ok(self.existing.lock().unwrap().get(name).map(|endpoint| DiscoveredUnit {
                name: name.to_string(),
                endpoint_url: Some(endpoint.clone()),
                running: true,
            }))
        }

        async fn create(&self, spec: &UnitSpec) -> anyhow::Result<String> {
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("image not found");
            }
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            // Let racing callers pile up on the lock.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let endpoint = format!("http://fake/{}/{}", spec.name, n);
            self.existing
                .lock()
                .unwrap()
                .insert(spec.name.clone(), endpoint.clone());
            Ok(endpoint)
        }

        async fn destroy(&self, name: &str) -> anyhow::Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            self.existing.lock().unwrap().remove(name);
            Ok(())
        }

        async fn probe(&self, _endpoint: &str) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    pub fn workspace(issue_id: &str) -> Workspace {
        Workspace {
            issue_id: issue_id.to_string(),
            project_id: "p1".into(),
            claude_state_path: "/tmp/state".into(),
            session_cache_path: "/tmp/state/message-cache".into(),
            source_path: "/tmp/src".into(),
            branch_name: "b".into(),
        }
    }

    pub fn fast_timings() -> BackendTimings {
        BackendTimings {
            provisioning_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }
}
