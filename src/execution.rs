//! Session operations across workspace, compute unit and worker.
//!
//! `ExecutionService` is the orchestrator's entry point: it prepares the
//! issue's workspace, makes sure its compute unit is running, proxies session
//! calls to the worker inside the unit and turns the worker's SSE stream into
//! reconstructed [`BridgeOutput`] items.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use agentdock_common::wire::codes;
use agentdock_common::{
    BridgeOutput, PermissionMode, SessionMode, SseDecoder, SseFrame, StreamBridge, StreamError,
    WireEvent,
};
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::backend::{ComputeBackend, ComputeUnit, unit_env};
use crate::config::{AuthSection, GitSection};
use crate::errors::{ExecutionError, WorkspaceError};
use crate::router::{OrchestratorSession, SessionRouter, SessionStatus};
use crate::workspace::{Workspace, WorkspaceManager};

/// Timeout for worker calls that do not stream.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_BUFFER: usize = 256;

/// Parameters of `start_session`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub issue_id: String,
    pub project_id: String,
    #[serde(default)]
    pub project_name: Option<String>,
    /// Required the first time an issue is started; later calls reuse the
    /// prepared workspace when omitted.
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Branch the project's main clone follows; `[git] default_branch` when omitted.
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub resume_id: Option<String>,
}

/// What `get_status` reports for an issue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatus {
    pub issue_id: String,
    pub running: bool,
    pub unit: Option<ComputeUnit>,
    pub sessions: Vec<OrchestratorSession>,
}

/// Reconstructed output of one streamed turn.
///
/// The pump feeding it runs in its own task and keeps the router up to date
/// even when this stream is dropped.
pub struct SessionStream {
    session: OrchestratorSession,
    inner: ReceiverStream<BridgeOutput>,
}

impl SessionStream {
    /// The session as registered when the stream was opened.
    pub fn session(&self) -> &OrchestratorSession {
        &self.session
    }
}

impl Stream for SessionStream {
    type Item = BridgeOutput;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Incremental SSE reader over a worker response body.
struct FrameReader<S> {
    body: S,
    decoder: SseDecoder,
    queue: VecDeque<SseFrame>,
    done: bool,
}

impl<S, B> FrameReader<S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    fn new(body: S) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    async fn next_event(&mut self) -> Result<Option<WireEvent>, ExecutionError> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                match WireEvent::from_frame(&frame) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => {
                        tracing::debug!(event = %frame.event, "Skipping unknown stream event");
                        continue;
                    }
                    Err(e) => return Err(ExecutionError::Protocol(e.to_string())),
                }
            }
            if self.done {
                return Ok(None);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.queue.extend(self.decoder.feed(chunk.as_ref())),
                Some(Err(e)) => return Err(ExecutionError::Transport(e)),
                None => {
                    self.done = true;
                    self.queue.extend(self.decoder.finish());
                }
            }
        }
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

pub struct ExecutionService {
    workspaces: Arc<WorkspaceManager>,
    backend: Arc<dyn ComputeBackend>,
    router: Arc<SessionRouter>,
    client: reqwest::Client,
    git: GitSection,
    auth: AuthSection,
}

impl ExecutionService {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        backend: Arc<dyn ComputeBackend>,
        router: Arc<SessionRouter>,
        git: GitSection,
        auth: AuthSection,
    ) -> Self {
        Self {
            workspaces,
            backend,
            router,
            client: reqwest::Client::new(),
            git,
            auth,
        }
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    async fn prepare_workspace(&self, req: &StartSession) -> Result<Workspace, WorkspaceError> {
        match &req.repo_url {
            Some(url) => {
                let default_branch = req
                    .default_branch
                    .as_deref()
                    .unwrap_or(&self.git.default_branch);
                self.workspaces
                    .ensure_project(&req.project_id, url, default_branch)
                    .await?;
                let branch = req
                    .branch_name
                    .clone()
                    .unwrap_or_else(|| format!("agentdock/issue-{}", req.issue_id));
                self.workspaces
                    .ensure_issue_workspace(&req.issue_id, &req.project_id, url, &branch)
                    .await
            }
            None => self.workspaces.get_workspace(&req.issue_id).await,
        }
    }

    /// Prepare the workspace, ensure the unit, open a worker session and
    /// stream its first turn.
    pub async fn start_session(&self, req: StartSession) -> Result<SessionStream, ExecutionError> {
        let workspace = self.prepare_workspace(&req).await?;
        let project_name = req.project_name.as_deref().unwrap_or(&req.project_id);
        let env = unit_env(&workspace, project_name, &self.git, &self.auth);
        let unit = self
            .backend
            .ensure_running(&req.issue_id, &workspace, env)
            .await?;

        let body = json!({
            "prompt": req.prompt,
            "model": req.model,
            "mode": req.mode,
            "systemPrompt": req.system_prompt,
            "resumeId": req.resume_id,
        });
        let resp = self
            .client
            .post(format!("{}/sessions", unit.endpoint_url))
            .json(&body)
            .send()
            .await?;
        let resp = check(resp).await?;

        let mut reader = FrameReader::new(body_stream(resp));
        let started = match reader.next_event().await? {
            Some(WireEvent::SessionStarted(started)) => started,
            Some(WireEvent::Error(err)) => {
                return Err(ExecutionError::Worker {
                    status: 500,
                    message: err.message,
                });
            }
            Some(other) => {
                return Err(ExecutionError::Protocol(format!(
                    "expected session_started, got {}",
                    other.event_type()
                )));
            }
            None => {
                return Err(ExecutionError::Protocol(
                    "stream ended before session_started".into(),
                ));
            }
        };

        let session = OrchestratorSession {
            session_id: started.session_id.clone(),
            issue_id: req.issue_id.clone(),
            project_id: req.project_id.clone(),
            compute_unit_id: unit.unit_id.clone(),
            endpoint_url: unit.endpoint_url.clone(),
            conversation_id: started.conversation_id.clone(),
            status: SessionStatus::Streaming,
        };
        self.router.register(session.clone());
        self.backend.touch(&req.issue_id);
        tracing::info!(
            issue_id = %req.issue_id,
            session_id = %session.session_id,
            unit = %unit.unit_id,
            resumed = started.resumed,
            "Session started"
        );

        Ok(self.spawn_pump(
            session,
            reader,
            Some(WireEvent::SessionStarted(started)),
        ))
    }

    /// Send a follow-up and stream the resulting turn.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        model: Option<String>,
        permission_mode: Option<PermissionMode>,
    ) -> Result<SessionStream, ExecutionError> {
        let session = self.lookup(session_id)?;
        let resp = self
            .client
            .post(self.session_url(&session, "/message"))
            .json(&json!({
                "message": message,
                "model": model,
                "permissionMode": permission_mode,
            }))
            .send()
            .await?;
        let resp = self.check_session(session_id, resp).await?;

        self.router.set_status(session_id, SessionStatus::Streaming);
        self.backend.touch(&session.issue_id);
        Ok(self.spawn_pump(session, FrameReader::new(body_stream(resp)), None))
    }

    /// Interrupt the current turn. The session stays resumable.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), ExecutionError> {
        let session = self.lookup(session_id)?;
        let resp = self
            .client
            .post(self.session_url(&session, "/interrupt"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        self.check_session(session_id, resp).await?;
        tracing::info!(session_id, "Session interrupted");
        Ok(())
    }

    /// Close the worker-side session. The compute unit keeps running.
    pub async fn stop(&self, session_id: &str) -> Result<(), ExecutionError> {
        let session = self.lookup(session_id)?;
        let resp = self
            .client
            .delete(self.session_url(&session, ""))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            check(resp).await?;
        }
        self.router.set_status(session_id, SessionStatus::Closed);
        self.router.unregister(session_id);
        tracing::info!(session_id, issue_id = %session.issue_id, "Session stopped");
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<OrchestratorSession, ExecutionError> {
        self.lookup(session_id)
    }

    pub async fn get_status(&self, issue_id: &str) -> Result<IssueStatus, ExecutionError> {
        let running = self.backend.is_running(issue_id).await?;
        Ok(IssueStatus {
            issue_id: issue_id.to_string(),
            running,
            unit: self.backend.unit(issue_id),
            sessions: self.router.sessions_for_issue(issue_id),
        })
    }

    /// Answer a pending `AskUserQuestion`. `Ok(false)` when nothing was pending.
    pub async fn answer_question(
        &self,
        session_id: &str,
        answers: HashMap<String, String>,
    ) -> Result<bool, ExecutionError> {
        self.resolve(session_id, "/question", json!({ "answers": answers }))
            .await
    }

    /// Approve or reject a pending plan. `Ok(false)` when nothing was pending.
    pub async fn resolve_plan(&self, session_id: &str, approved: bool) -> Result<bool, ExecutionError> {
        self.resolve(session_id, "/plan", json!({ "approved": approved }))
            .await
    }

    async fn resolve(
        &self,
        session_id: &str,
        suffix: &str,
        body: serde_json::Value,
    ) -> Result<bool, ExecutionError> {
        let session = self.lookup(session_id)?;
        let resp = self
            .client
            .post(self.session_url(&session, suffix))
            .timeout(CONTROL_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let resp = self.check_session(session_id, resp).await?;
        let body: serde_json::Value = resp.json().await?;
        Ok(body["resolved"].as_bool().unwrap_or(false))
    }

    /// Finish an issue: close its sessions, then stop its unit.
    pub async fn stop_issue(&self, issue_id: &str) -> Result<(), ExecutionError> {
        for session in self.router.sessions_for_issue(issue_id) {
            if let Err(e) = self.stop(&session.session_id).await {
                tracing::warn!(issue_id, session_id = %session.session_id, error = %e, "Failed to close session");
                self.router.unregister(&session.session_id);
            }
        }
        self.backend.stop(issue_id).await?;
        Ok(())
    }

    /// `stop_issue`, then remove the issue's workspace directories.
    pub async fn cleanup_issue(&self, issue_id: &str) -> Result<(), ExecutionError> {
        self.stop_issue(issue_id).await?;
        self.workspaces.cleanup(issue_id).await?;
        Ok(())
    }

    /// Stop units idle for longer than `threshold`, skipping issues with a
    /// turn in flight. Returns the issues that were stopped.
    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<String> {
        let mut stopped = Vec::new();
        for issue_id in self.backend.list_idle(threshold).await {
            if self.router.has_streaming(&issue_id) {
                tracing::debug!(issue_id = %issue_id, "Skipping idle sweep, session streaming");
                continue;
            }
            match self.stop_issue(&issue_id).await {
                Ok(()) => {
                    tracing::info!(issue_id = %issue_id, "Stopped idle compute unit");
                    stopped.push(issue_id);
                }
                Err(e) => tracing::warn!(issue_id = %issue_id, error = %e, "Idle sweep failed"),
            }
        }
        stopped
    }

    fn lookup(&self, session_id: &str) -> Result<OrchestratorSession, ExecutionError> {
        self.router
            .get(session_id)
            .ok_or_else(|| ExecutionError::session_not_found(session_id))
    }

    fn session_url(&self, session: &OrchestratorSession, suffix: &str) -> String {
        let endpoint = self
            .backend
            .unit(&session.issue_id)
            .map(|u| u.endpoint_url)
            .unwrap_or_else(|| session.endpoint_url.clone());
        format!("{}/sessions/{}{}", endpoint, session.session_id, suffix)
    }

    /// Like [`check`], but a 404 means the worker forgot the session.
    async fn check_session(
        &self,
        session_id: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ExecutionError> {
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            self.router.unregister(session_id);
            return Err(ExecutionError::session_not_found(session_id));
        }
        check(resp).await
    }

    fn spawn_pump<S, B>(
        &self,
        session: OrchestratorSession,
        reader: FrameReader<S>,
        first: Option<WireEvent>,
    ) -> SessionStream
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pump = Pump {
            session_id: session.session_id.clone(),
            issue_id: session.issue_id.clone(),
            router: self.router.clone(),
            backend: self.backend.clone(),
            tx,
        };
        tokio::spawn(pump.run(reader, first));
        SessionStream {
            session,
            inner: ReceiverStream::new(rx),
        }
    }
}

/// Moves one turn from the worker to the caller and the router.
struct Pump {
    session_id: String,
    issue_id: String,
    router: Arc<SessionRouter>,
    backend: Arc<dyn ComputeBackend>,
    tx: mpsc::Sender<BridgeOutput>,
}

impl Pump {
    async fn run<S, B>(self, mut reader: FrameReader<S>, first: Option<WireEvent>)
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut bridge = StreamBridge::new();
        if let Some(event) = first {
            self.forward(&mut bridge, event).await;
        }

        loop {
            match reader.next_event().await {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    self.backend.touch(&self.issue_id);
                    self.forward(&mut bridge, event).await;
                    if terminal {
                        break;
                    }
                }
                Ok(None) => {
                    let err = StreamError::new(codes::AGENT_ERROR, "worker stream ended before the turn completed");
                    self.forward(&mut bridge, WireEvent::Error(err)).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Worker stream failed");
                    let err = StreamError::new(e.code(), e.to_string());
                    self.forward(&mut bridge, WireEvent::Error(err)).await;
                    break;
                }
            }
        }

        // Stop may have closed the session while the turn drained.
        if self.router.get(&self.session_id).is_some_and(|s| s.status == SessionStatus::Streaming) {
            self.router.set_status(&self.session_id, SessionStatus::Idle);
        }
    }

    async fn forward(&self, bridge: &mut StreamBridge, event: WireEvent) {
        for output in bridge.push(event) {
            if let BridgeOutput::TurnComplete(summary) = &output {
                let conversation = summary
                    .conversation_id
                    .as_deref()
                    .or(bridge.conversation_id());
                if let Some(conversation) = conversation {
                    self.router.record_result(&self.session_id, conversation);
                }
                tracing::info!(
                    session_id = %self.session_id,
                    is_error = summary.is_error,
                    num_turns = summary.num_turns,
                    "Turn complete"
                );
            }
            // The caller may be gone; keep draining so the router stays current.
            let _ = self.tx.send(output).await;
        }
    }
}

fn body_stream(resp: reqwest::Response) -> BodyStream {
    Box::pin(resp.bytes_stream())
}

/// Map a non-2xx worker response to `ExecutionError::Worker`.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ExecutionError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(text);
    Err(ExecutionError::Worker { status, message })
}

/// Periodically stop idle units until `cancel` fires.
pub fn spawn_idle_reaper(
    service: Arc<ExecutionService>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stopped = service.sweep_idle(threshold).await;
                    if !stopped.is_empty() {
                        tracing::info!(count = stopped.len(), "Idle sweep stopped units");
                    }
                }
            }
        }
        tracing::debug!("Idle reaper stopped");
    })
}
