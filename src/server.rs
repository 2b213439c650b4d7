use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::backend::{ComputeBackend, build_backend};
use crate::config::Config;
use crate::execution::{ExecutionService, spawn_idle_reaper};
use crate::router::SessionRouter;
use crate::workspace::WorkspaceManager;

/// Build the full application router.
pub fn build_router(state: SharedState, cors: bool) -> Router {
    let app = api::api_router().with_state(state);
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Wire the services described by `config` around `backend`.
pub fn build_execution(config: &Config, backend: Arc<dyn ComputeBackend>) -> Arc<ExecutionService> {
    let workspaces = Arc::new(WorkspaceManager::new(
        config.workspace.root.clone(),
        config.auth.github_token.clone(),
        config.git.author_name.clone(),
        config.git.author_email.clone(),
    ));
    Arc::new(ExecutionService::new(
        workspaces,
        backend,
        Arc::new(SessionRouter::new()),
        config.git.clone(),
        config.auth.clone(),
    ))
}

/// Serve the orchestrator API until `shutdown` resolves.
pub async fn serve(
    config: Config,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let backend = build_backend(&config)?;
    let execution = build_execution(&config, backend);

    let cancel = CancellationToken::new();
    let reaper = spawn_idle_reaper(
        execution.clone(),
        Duration::from_secs(config.backend.sweep_interval_secs),
        Duration::from_secs(config.backend.idle_timeout_secs),
        cancel.clone(),
    );

    let state = Arc::new(AppState { execution });
    let app = build_router(state, config.server.cors);

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = %config.backend.kind,
        workspace_root = %config.workspace.root.display(),
        "agentdock listening"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    cancel.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Idle reaper task failed");
    }
    tracing::info!("Server shut down gracefully");
    result
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManagedBackend;
    use crate::backend::testing::{FakeDriver, fast_timings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router(cors: bool) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace.root = dir.path().to_path_buf();
        let backend = Arc::new(ManagedBackend::new(FakeDriver::healthy(), fast_timings()));
        let execution = build_execution(&config, backend);
        let state = Arc::new(AppState { execution });
        (dir, build_router(state, cors))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (_dir, app) = test_router(false);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_layer_answers_preflight() {
        let (_dir, app) = test_router(true);
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/issues/42/status")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_dir, app) = test_router(false);
        let req = Request::builder()
            .uri("/api/nothing")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
