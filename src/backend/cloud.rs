//! Cloud container-app driver.
//!
//! Talks to a control plane exposing one resource per app:
//! `GET|PUT|DELETE {api_base}/apps/{name}`, authenticated with a bearer token.
//! The issue's state and source directories live on a shared storage volume
//! under `issues/{id}/state` and `issues/{id}/src`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{
    DiscoveredUnit, HealthProbe, LABEL_ISSUE_ID, LABEL_MANAGED, UNIT_SOURCE_DIR, UNIT_STATE_DIR,
    UnitDriver, UnitSpec, WORKER_PORT,
};
use crate::config::{BackendKind, CloudSection};

/// Container-app names are short DNS labels.
const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub cpu: f64,
    pub memory: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ingress: Ingress,
    pub volumes: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub target_port: u16,
    pub external: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub volume: String,
    pub sub_path: String,
    pub mount_path: String,
}

/// What the control plane reports about an app.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl AppStatus {
    fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

pub struct CloudDriver {
    client: reqwest::Client,
    api_base: String,
    token: String,
    config: CloudSection,
    probe: HealthProbe,
}

impl CloudDriver {
    pub fn new(config: CloudSection, probe: HealthProbe) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .context("[backend.cloud] api_base is required for the cloud backend")?;
        let token = config
            .token
            .clone()
            .context("[backend.cloud] token (or AGENTDOCK_CLOUD_TOKEN) is required for the cloud backend")?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            config,
            probe,
        })
    }

    fn app_url(&self, name: &str) -> String {
        format!("{}/apps/{}", self.api_base, name)
    }

    pub fn definition(&self, spec: &UnitSpec) -> AppDefinition {
        let volume = self
            .config
            .storage_volume
            .clone()
            .unwrap_or_else(|| "agentdock".to_string());
        let labels = BTreeMap::from([
            (LABEL_ISSUE_ID.to_string(), spec.issue_id.clone()),
            (LABEL_MANAGED.to_string(), "true".to_string()),
        ]);
        AppDefinition {
            name: spec.name.clone(),
            image: self.config.image.clone(),
            region: self.config.region.clone(),
            cpu: self.config.cpu,
            memory: self.config.memory.clone(),
            env: spec.env.clone(),
            labels,
            ingress: Ingress {
                target_port: WORKER_PORT,
                external: true,
            },
            volumes: vec![
                VolumeMount {
                    volume: volume.clone(),
                    sub_path: format!("issues/{}/state", spec.workspace.issue_id),
                    mount_path: UNIT_STATE_DIR.to_string(),
                },
                VolumeMount {
                    volume,
                    sub_path: format!("issues/{}/src", spec.workspace.issue_id),
                    mount_path: UNIT_SOURCE_DIR.to_string(),
                },
            ],
        }
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("{} {}", status, body.trim())
}

#[async_trait]
impl UnitDriver for CloudDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn max_name_len(&self) -> usize {
        MAX_NAME_LEN
    }

    async fn find(&self, name: &str) -> Result<Option<DiscoveredUnit>> {
        let resp = self
            .client
            .get(self.app_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to look up app {}", name))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("Looking up app {} failed: {}", name, error_body(resp).await);
        }
        let app: AppStatus = resp
            .json()
            .await
            .with_context(|| format!("Invalid app status for {}", name))?;
        Ok(Some(DiscoveredUnit {
            running: app.is_running(),
            name: app.name,
            endpoint_url: app.url,
        }))
    }

    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        let definition = self.definition(spec);
        let resp = self
            .client
            .put(self.app_url(&spec.name))
            .bearer_auth(&self.token)
            .json(&definition)
            .send()
            .await
            .with_context(|| format!("Failed to create app {}", spec.name))?;
        if !resp.status().is_success() {
            anyhow::bail!("Creating app {} failed: {}", spec.name, error_body(resp).await);
        }
        let app: AppStatus = resp
            .json()
            .await
            .with_context(|| format!("Invalid app status for {}", spec.name))?;
        app.url
            .with_context(|| format!("App {} was created without an ingress URL", spec.name))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.app_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to delete app {}", name))?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        anyhow::bail!("Deleting app {} failed: {}", name, error_body(resp).await)
    }

    async fn probe(&self, endpoint: &str) -> bool {
        self.probe.check(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::workspace;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode as HttpStatus},
        routing::get,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Apps = Arc<Mutex<HashMap<String, AppDefinition>>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret")
    }

    async fn control_plane() -> (String, Apps) {
        let apps: Apps = Arc::default();
        let router = Router::new()
            .route(
                "/apps/{name}",
                get(
                    |State(apps): State<Apps>, Path(name): Path<String>, headers: HeaderMap| async move {
                        if !authorized(&headers) {
                            return Err(HttpStatus::UNAUTHORIZED);
                        }
                        let apps = apps.lock().unwrap();
                        let app = apps.get(&name).ok_or(HttpStatus::NOT_FOUND)?;
                        Ok(Json(serde_json::json!({
                            "name": app.name,
                            "status": "Running",
                            "url": format!("https://{}.apps.test", app.name),
                        })))
                    },
                )
                .put(
                    |State(apps): State<Apps>,
                     Path(name): Path<String>,
                     headers: HeaderMap,
                     Json(def): Json<AppDefinition>| async move {
                        if !authorized(&headers) {
                            return Err(HttpStatus::UNAUTHORIZED);
                        }
                        apps.lock().unwrap().insert(name.clone(), def);
                        Ok(Json(serde_json::json!({
                            "name": name,
                            "status": "Provisioning",
                            "url": format!("https://{}.apps.test", name),
                        })))
                    },
                )
                .delete(
                    |State(apps): State<Apps>, Path(name): Path<String>| async move {
                        match apps.lock().unwrap().remove(&name) {
                            Some(_) => HttpStatus::NO_CONTENT,
                            None => HttpStatus::NOT_FOUND,
                        }
                    },
                ),
            )
            .with_state(apps.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), apps)
    }

    fn driver(api_base: &str, token: &str) -> CloudDriver {
        let config = CloudSection {
            api_base: Some(api_base.to_string()),
            token: Some(token.to_string()),
            storage_volume: Some("shared".into()),
            ..Default::default()
        };
        CloudDriver::new(config, HealthProbe::new(Duration::from_secs(1)).unwrap()).unwrap()
    }

    fn spec() -> UnitSpec {
        UnitSpec {
            issue_id: "42".into(),
            name: "unit-issue-42".into(),
            workspace: workspace("42"),
            env: BTreeMap::from([("ISSUE_ID".to_string(), "42".to_string())]),
        }
    }

    #[test]
    fn requires_api_base_and_token() {
        let probe = HealthProbe::new(Duration::from_secs(1)).unwrap();
        assert!(CloudDriver::new(CloudSection::default(), probe.clone()).is_err());
        let config = CloudSection {
            api_base: Some("http://cp".into()),
            ..Default::default()
        };
        assert!(CloudDriver::new(config, probe).is_err());
    }

    #[test]
    fn definition_mounts_issue_subpaths() {
        let def = driver("http://cp/", "t").definition(&spec());
        assert_eq!(def.ingress.target_port, 8080);
        assert_eq!(def.volumes[0].volume, "shared");
        assert_eq!(def.volumes[0].sub_path, "issues/42/state");
        assert_eq!(def.volumes[0].mount_path, "/home/agent/.claude");
        assert_eq!(def.volumes[1].sub_path, "issues/42/src");
        assert_eq!(def.volumes[1].mount_path, "/workspace");
        assert_eq!(def.labels[LABEL_ISSUE_ID], "42");
    }

    #[tokio::test]
    async fn create_find_destroy_against_control_plane() {
        let (base, apps) = control_plane().await;
        let driver = driver(&base, "secret");

        assert!(driver.find("unit-issue-42").await.unwrap().is_none());

        let endpoint = driver.create(&spec()).await.unwrap();
        assert_eq!(endpoint, "https://unit-issue-42.apps.test");
        assert_eq!(apps.lock().unwrap()["unit-issue-42"].env["ISSUE_ID"], "42");

        let found = driver.find("unit-issue-42").await.unwrap().unwrap();
        assert!(found.running);
        assert_eq!(found.endpoint_url.as_deref(), Some("https://unit-issue-42.apps.test"));

        driver.destroy("unit-issue-42").await.unwrap();
        driver.destroy("unit-issue-42").await.unwrap();
        assert!(apps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_token_surfaces_status() {
        let (base, _apps) = control_plane().await;
        let err = driver(&base, "wrong").create(&spec()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("401"), "{err:#}");
    }
}
