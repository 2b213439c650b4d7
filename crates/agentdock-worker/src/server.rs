//! HTTP surface of a compute unit.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use agentdock_common::wire::SessionStarted;
use agentdock_common::{PermissionMode, SessionMode, WireEvent};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::TranscriptCache;
use crate::config::{RuntimeKind, WorkerConfig};
use crate::error::ApiError;
use crate::files::{DEFAULT_MAX_BYTES, FileReader};
use crate::runtime::AgentRuntime;
use crate::runtime::claude::ClaudeCliRuntime;
use crate::runtime::scripted::ScriptedRuntime;
use crate::session::{CreateSession, WorkerSessionManager};

pub struct WorkerState {
    pub config: WorkerConfig,
    pub sessions: Arc<WorkerSessionManager>,
    pub files: FileReader,
}

pub type SharedState = Arc<WorkerState>;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

impl WorkerState {
    pub fn new(config: WorkerConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let cache = TranscriptCache::new(config.message_cache_dir());
        let sessions = Arc::new(WorkerSessionManager::new(
            runtime,
            config.working_directory.clone(),
            Some(cache),
        ));
        let files = FileReader::new(
            vec![
                config.working_directory.clone(),
                config.claude_config_dir.clone(),
            ],
            DEFAULT_MAX_BYTES,
        );
        Self {
            config,
            sessions,
            files,
        }
    }

    /// State with the runtime selected by `AGENT_RUNTIME`.
    pub fn from_config(config: WorkerConfig) -> Self {
        let runtime: Arc<dyn AgentRuntime> = match config.runtime {
            RuntimeKind::Claude => Arc::new(ClaudeCliRuntime::new(config.claude_cmd.clone())),
            RuntimeKind::Scripted => Arc::new(ScriptedRuntime::echo()),
        };
        Self::new(config, runtime)
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(close_session))
        .route("/sessions/{id}/message", post(send_message))
        .route("/sessions/{id}/interrupt", post(interrupt_session))
        .route("/sessions/{id}/question", post(answer_question))
        .route("/sessions/{id}/plan", post(resolve_plan))
        .route("/files/read", post(read_file))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every session.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let sessions = state.sessions.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Worker server error")?;
    sessions.shutdown().await;
    Ok(())
}

fn to_event(event: &WireEvent) -> Event {
    match event.to_frame() {
        Ok(frame) => Event::default().event(frame.event).data(frame.data),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode stream event");
            Event::default().event("error").data(
                json!({"code": agentdock_common::wire::codes::AGENT_ERROR, "message": e.to_string()})
                    .to_string(),
            )
        }
    }
}

fn sse_response(
    first: Option<WireEvent>,
    rx: mpsc::Receiver<WireEvent>,
) -> Sse<KeepAliveStream<EventStream>> {
    let head = stream::iter(first.map(|ev| Ok(to_event(&ev))));
    let body = ReceiverStream::new(rx).map(|ev| Ok(to_event(&ev)));
    let events: EventStream = Box::pin(head.chain(body));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn info(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "issueId": state.config.issue_id,
        "projectId": state.config.project_id,
        "projectName": state.config.project_name,
        "status": "running",
        "activeSessions": state.sessions.active_count(),
    }))
}

async fn list_sessions(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let discoverable = state.sessions.discoverable().await?;
    Ok(Json(json!({
        "active": state.sessions.list(),
        "discoverable": discoverable,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    mode: SessionMode,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    resume_id: Option<String>,
}

async fn create_session(
    State(state): State<SharedState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let created = state
        .sessions
        .create(CreateSession {
            prompt: body.prompt,
            model: body.model,
            mode: body.mode,
            system_prompt: body.system_prompt,
            resume_id: body.resume_id,
        })
        .await?;

    let started = WireEvent::SessionStarted(SessionStarted {
        session_id: created.session.id.clone(),
        conversation_id: created.session.conversation_id(),
        resumed: created.resumed,
    });
    let rx = state.sessions.stream(created.session);
    Ok(sse_response(Some(started), rx))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.get(&id)?))
}

async fn close_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.close(&id).await?;
    Ok(Json(json!({"status": "closed"})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<PermissionMode>,
}

async fn send_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let session = state
        .sessions
        .send(&id, &body.message, body.model.as_deref(), body.permission_mode)
        .await?;
    let rx = state.sessions.stream(session);
    Ok(sse_response(None, rx))
}

async fn interrupt_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.interrupt(&id).await?;
    Ok(Json(json!({"status": "interrupted"})))
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    answers: HashMap<String, String>,
}

async fn answer_question(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.sessions.resolve_question(&id, body.answers)?;
    Ok(Json(json!({"resolved": resolved})))
}

#[derive(Debug, Deserialize)]
struct PlanBody {
    approved: bool,
}

async fn resolve_plan(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<PlanBody>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state.sessions.resolve_plan(&id, body.approved)?;
    Ok(Json(json!({"resolved": resolved})))
}

#[derive(Debug, Deserialize)]
struct ReadFileBody {
    path: String,
}

async fn read_file(
    State(state): State<SharedState>,
    Json(body): Json<ReadFileBody>,
) -> Result<impl IntoResponse, ApiError> {
    let content = state.files.read(&body.path).await?;
    Ok((StatusCode::OK, Json(content)))
}
