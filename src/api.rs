//! Orchestrator HTTP handlers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use agentdock_common::wire::codes;
use agentdock_common::{BridgeOutput, PermissionMode, StreamError};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::json;

use crate::errors::ExecutionError;
use crate::execution::{ExecutionService, SessionStream, StartSession};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub execution: Arc<ExecutionService>,
}

pub type SharedState = Arc<AppState>;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub project_id: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub mode: agentdock_common::SessionMode,
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub resume_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopIssueParams {
    /// Also remove the issue's workspace directories.
    #[serde(default)]
    pub cleanup: bool,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub approved: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, codes::SESSION_NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, codes::UPSTREAM_ERROR, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg),
        };
        (status, Json(json!({"error": message, "code": code}))).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let msg = err.to_string();
        match err {
            ExecutionError::SessionNotFound { .. } => ApiError::NotFound(msg),
            ExecutionError::Worker { status: 404, .. } => ApiError::NotFound(msg),
            ExecutionError::Worker { status: 409, .. } => ApiError::Conflict(msg),
            ExecutionError::Worker { .. } | ExecutionError::Transport(_) => ApiError::Upstream(msg),
            ExecutionError::Workspace(crate::errors::WorkspaceError::InvalidId { .. }) => {
                ApiError::BadRequest(msg)
            }
            _ => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/issues/{issue_id}/sessions", post(start_session))
        .route("/api/issues/{issue_id}/status", get(issue_status))
        .route("/api/issues/{issue_id}/stop", post(stop_issue))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(stop_session),
        )
        .route("/api/sessions/{id}/message", post(send_message))
        .route("/api/sessions/{id}/interrupt", post(interrupt_session))
        .route("/api/sessions/{id}/question", post(answer_question))
        .route("/api/sessions/{id}/plan", post(resolve_plan))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn event_name(output: &BridgeOutput) -> &'static str {
    match output {
        BridgeOutput::SessionStarted(_) => "session_started",
        BridgeOutput::System { .. } => "system",
        BridgeOutput::Block { .. } => "block",
        BridgeOutput::ToolResult { .. } => "tool_result",
        BridgeOutput::QuestionPending(_) => "question_pending",
        BridgeOutput::PlanPending(_) => "plan_pending",
        BridgeOutput::TurnComplete(_) => "turn_complete",
        BridgeOutput::Error(_) => "error",
    }
}

fn to_event(output: &BridgeOutput) -> Event {
    let data = serde_json::to_string(output).unwrap_or_else(|e| {
        json!({"kind": "error", "code": codes::AGENT_ERROR, "message": e.to_string()}).to_string()
    });
    Event::default().event(event_name(output)).data(data)
}

fn sse(events: EventStream) -> Sse<KeepAliveStream<EventStream>> {
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn stream_response(stream: SessionStream) -> Sse<KeepAliveStream<EventStream>> {
    sse(Box::pin(stream.map(|output| Ok(to_event(&output)))))
}

/// A stream holding one terminal `error` event.
fn error_response(err: &ExecutionError) -> Sse<KeepAliveStream<EventStream>> {
    let output = BridgeOutput::Error(StreamError::new(err.code(), err.to_string()));
    sse(Box::pin(stream::iter([Ok(to_event(&output))])))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn start_session(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let start = StartSession {
        issue_id,
        project_id: req.project_id,
        project_name: req.project_name,
        repo_url: req.repo_url,
        branch_name: req.branch_name,
        default_branch: req.default_branch,
        mode: req.mode,
        model: req.model,
        prompt: req.prompt,
        system_prompt: req.system_prompt,
        resume_id: req.resume_id,
    };
    let issue_id = start.issue_id.clone();
    match state.execution.start_session(start).await {
        Ok(stream) => Ok(stream_response(stream)),
        Err(e) => {
            tracing::warn!(issue_id = %issue_id, code = e.code(), error = %e, "Failed to start session");
            Ok(error_response(&e))
        }
    }
}

async fn send_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    match state
        .execution
        .send_message(&id, &req.message, req.model, req.permission_mode)
        .await
    {
        Ok(stream) => Ok(stream_response(stream)),
        Err(e @ ExecutionError::SessionNotFound { .. }) => Err(e.into()),
        Err(e) => {
            tracing::warn!(session_id = %id, code = e.code(), error = %e, "Failed to send message");
            Ok(error_response(&e))
        }
    }
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.execution.get_session(&id)?))
}

async fn stop_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.execution.stop(&id).await?;
    Ok(Json(json!({"status": "closed"})))
}

async fn interrupt_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.execution.interrupt(&id).await?;
    Ok(Json(json!({"status": "interrupted"})))
}

async fn answer_question(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.execution.answer_question(&id, req.answers).await?;
    Ok(Json(json!({"resolved": resolved})))
}

async fn resolve_plan(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.execution.resolve_plan(&id, req.approved).await?;
    Ok(Json(json!({"resolved": resolved})))
}

async fn issue_status(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.execution.get_status(&issue_id).await?))
}

async fn stop_issue(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
    Query(params): Query<StopIssueParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.cleanup {
        state.execution.cleanup_issue(&issue_id).await?;
    } else {
        state.execution.stop_issue(&issue_id).await?;
    }
    Ok(Json(json!({"status": "stopped", "cleanup": params.cleanup})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManagedBackend;
    use crate::backend::testing::{FakeDriver, fast_timings};
    use crate::config::{AuthSection, GitSection};
    use crate::router::SessionRouter;
    use crate::workspace::WorkspaceManager;
    use agentdock_common::{SseDecoder, SseFrame};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        router: Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = Arc::new(WorkspaceManager::new(
            dir.path().to_path_buf(),
            None,
            "bot",
            "bot@example.com",
        ));
        let backend = Arc::new(ManagedBackend::new(FakeDriver::healthy(), fast_timings()));
        let execution = Arc::new(ExecutionService::new(
            workspaces,
            backend,
            Arc::new(SessionRouter::new()),
            GitSection::default(),
            AuthSection::default(),
        ));
        let state = Arc::new(AppState { execution });
        Fixture {
            _dir: dir,
            router: api_router().with_state(state),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn sse_frames(body: Body) -> Vec<SseFrame> {
        let bytes = body.collect().await.unwrap().to_bytes();
        let mut decoder = SseDecoder::new();
        let mut frames = decoder.feed(&bytes);
        frames.extend(decoder.finish());
        frames
    }

    #[tokio::test]
    async fn test_health() {
        let app = fixture();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = fixture();
        let req = Request::builder()
            .uri("/api/sessions/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp.into_body()).await["code"], "SESSION_NOT_FOUND");

        let resp = app
            .router
            .clone()
            .oneshot(post_json("/api/sessions/nope/message", json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .router
            .oneshot(post_json("/api/sessions/nope/plan", json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_without_workspace_streams_error() {
        let app = fixture();
        let resp = app
            .router
            .oneshot(post_json(
                "/api/issues/42/sessions",
                json!({"projectId": "p1", "prompt": "add a test"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let frames = sse_frames(resp.into_body()).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "error");
        let data: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(data["code"], "WORKSPACE_FAILED");
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let app = fixture();
        let resp = app
            .router
            .oneshot(post_json(
                "/api/issues/42/sessions",
                json!({"projectId": "p1", "prompt": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_issue_status_without_unit() {
        let app = fixture();
        let req = Request::builder()
            .uri("/api/issues/42/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp.into_body()).await;
        assert_eq!(body["issueId"], "42");
        assert_eq!(body["running"], false);
        assert!(body["unit"].is_null());
        assert_eq!(body["sessions"], json!([]));
    }

    #[tokio::test]
    async fn test_stop_issue_is_idempotent() {
        let app = fixture();
        for _ in 0..2 {
            let resp = app
                .router
                .clone()
                .oneshot(post_json("/api/issues/42/stop", json!({})))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_stop_issue_with_cleanup_removes_workspace() {
        let app = fixture();
        let issue_dir = app._dir.path().join("issues/42");
        std::fs::create_dir_all(issue_dir.join("state")).unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(post_json("/api/issues/42/stop?cleanup=true", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp.into_body()).await;
        assert_eq!(body["cleanup"], true);
        assert!(!issue_dir.exists());
    }
}
