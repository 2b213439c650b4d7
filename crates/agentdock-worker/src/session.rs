//! Worker-side session manager.
//!
//! Each [`WorkerSession`] wraps one agent session and moves through
//! `streaming ⇄ idle → closed`. Turns are pumped by a spawned task that owns
//! the agent stream for the whole turn, so a client disconnect never stalls
//! the agent: the pump keeps draining and updating state on its own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use agentdock_common::wire::{StreamError, codes};
use agentdock_common::{PermissionMode, SdkMessage, SessionMode, WireEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedConversation, TranscriptCache};
use crate::error::WorkerError;
use crate::interaction::{InteractionRegistry, PendingInfo, SessionGate};
use crate::runtime::{AgentRuntime, AgentSession, SessionOptions};

const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Streaming,
    Idle,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub prompt: String,
    pub model: Option<String>,
    pub mode: SessionMode,
    pub system_prompt: Option<String>,
    pub resume_id: Option<String>,
}

#[derive(Debug, Clone)]
struct SessionState {
    conversation_id: Option<String>,
    permission_mode: PermissionMode,
    model: Option<String>,
    status: SessionStatus,
    /// Mode change to apply once the next turn has produced its first message.
    pending_mode: Option<PermissionMode>,
    /// Terminal event for a turn cut short by `close`.
    closed_with: Option<StreamError>,
    last_activity_at: DateTime<Utc>,
}

pub struct WorkerSession {
    pub id: String,
    pub mode: SessionMode,
    pub created_at: DateTime<Utc>,
    agent: Arc<dyn AgentSession>,
    state: StdMutex<SessionState>,
    notices: Mutex<mpsc::UnboundedReceiver<WireEvent>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation_id: Option<String>,
    pub mode: SessionMode,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingInfo>,
}

impl WorkerSession {
    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.with_state(|s| s.status)
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.with_state(|s| s.conversation_id.clone())
    }

    fn snapshot(&self, pending: Option<PendingInfo>) -> SessionSnapshot {
        self.with_state(|s| SessionSnapshot {
            id: self.id.clone(),
            conversation_id: s.conversation_id.clone(),
            mode: self.mode,
            permission_mode: s.permission_mode,
            model: s.model.clone(),
            status: s.status,
            created_at: self.created_at,
            last_activity_at: s.last_activity_at,
            pending,
        })
    }
}

/// Outcome of [`WorkerSessionManager::create`].
pub struct Created {
    pub session: Arc<WorkerSession>,
    /// True when the prompt was routed to an existing session or a resumed conversation.
    pub resumed: bool,
}

pub struct WorkerSessionManager {
    runtime: Arc<dyn AgentRuntime>,
    sessions: DashMap<String, Arc<WorkerSession>>,
    interactions: Arc<InteractionRegistry>,
    cache: Option<TranscriptCache>,
    cwd: PathBuf,
}

impl WorkerSessionManager {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        cwd: impl Into<PathBuf>,
        cache: Option<TranscriptCache>,
    ) -> Self {
        Self {
            runtime,
            sessions: DashMap::new(),
            interactions: Arc::new(InteractionRegistry::new()),
            cache,
            cwd: cwd.into(),
        }
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<WorkerSession>, WorkerError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| WorkerError::not_found(session_id))
    }

    fn find_by_conversation(&self, conversation_id: &str) -> Option<Arc<WorkerSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().conversation_id().as_deref() == Some(conversation_id))
            .map(|entry| entry.value().clone())
    }

    /// Start a session, or resume one. A `resume_id` matching a live session
    /// sends the prompt to it instead of opening a second agent session.
    pub async fn create(&self, request: CreateSession) -> Result<Created, WorkerError> {
        if let Some(resume_id) = &request.resume_id
            && let Some(existing) = self.find_by_conversation(resume_id)
        {
            tracing::info!(session_id = %existing.id, conversation_id = %resume_id, "Routing prompt to live session");
            let session = self
                .send(&existing.id, &request.prompt, request.model.as_deref(), None)
                .await?;
            return Ok(Created {
                session,
                resumed: true,
            });
        }

        let id = format!("ws-{}", uuid::Uuid::new_v4());
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(SessionGate::new(
            id.clone(),
            self.interactions.clone(),
            notices_tx,
        ));
        let permission_mode = request.mode.permission_mode();
        let options = SessionOptions {
            cwd: self.cwd.clone(),
            model: request.model.clone(),
            permission_mode,
            allowed_tools: request.mode.allowed_tools(),
            system_prompt: request.system_prompt.clone(),
            resume: request.resume_id.clone(),
        };

        let agent = self.runtime.open(options, gate).await?;
        let now = Utc::now();
        let session = Arc::new(WorkerSession {
            id: id.clone(),
            mode: request.mode,
            created_at: now,
            agent,
            state: StdMutex::new(SessionState {
                conversation_id: request.resume_id.clone(),
                permission_mode,
                model: request.model,
                status: SessionStatus::Streaming,
                pending_mode: None,
                closed_with: None,
                last_activity_at: now,
            }),
            notices: Mutex::new(notices_rx),
            cancel: CancellationToken::new(),
        });
        self.sessions.insert(id.clone(), session.clone());

        if let Err(e) = session.agent.send(&request.prompt).await {
            self.sessions.remove(&id);
            session.agent.close().await;
            return Err(e);
        }
        tracing::info!(session_id = %id, mode = %request.mode, resumed = request.resume_id.is_some(), "Session created");

        Ok(Created {
            session,
            resumed: request.resume_id.is_some(),
        })
    }

    /// Queue a follow-up message. A permission-mode override is applied once
    /// the turn has produced its first message.
    pub async fn send(
        &self,
        session_id: &str,
        message: &str,
        model_override: Option<&str>,
        mode_override: Option<PermissionMode>,
    ) -> Result<Arc<WorkerSession>, WorkerError> {
        let session = self.lookup(session_id)?;
        if session.status() == SessionStatus::Closed {
            return Err(WorkerError::SessionClosed {
                session_id: session_id.to_string(),
            });
        }

        if let Some(model) = model_override {
            session.agent.set_model(model).await?;
            session.with_state(|s| s.model = Some(model.to_string()));
        }
        session.with_state(|s| {
            if let Some(mode) = mode_override {
                s.permission_mode = mode;
                s.pending_mode = Some(mode);
            }
            s.status = SessionStatus::Streaming;
            s.last_activity_at = Utc::now();
        });

        session.agent.send(message).await?;
        Ok(session)
    }

    /// Pump the current turn into a channel. The pump ends after the turn's
    /// `result` (or a terminal `error`) and leaves the session idle.
    pub fn stream(&self, session: Arc<WorkerSession>) -> mpsc::Receiver<WireEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cache = self.cache.clone();
        tokio::spawn(async move {
            pump_turn(session, cache, tx).await;
        });
        rx
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), WorkerError> {
        let session = self.lookup(session_id)?;
        session.agent.interrupt().await?;
        // A parked question or plan would otherwise hold the turn open.
        self.interactions.cancel(session_id);
        tracing::info!(session_id, "Session interrupted");
        Ok(())
    }

    pub async fn close(&self, session_id: &str) -> Result<(), WorkerError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| WorkerError::not_found(session_id))?;
        let reason = match self.interactions.pending(session_id) {
            Some(pending) => StreamError::new(
                codes::INTERACTION_REJECTED,
                format!("Session closed while waiting for {}", pending.kind.label()),
            ),
            None => StreamError::new(codes::SESSION_CLOSED, "Session closed during the turn"),
        };
        session.with_state(|s| {
            s.status = SessionStatus::Closed;
            s.closed_with = Some(reason);
        });
        session.cancel.cancel();
        self.interactions.cancel(session_id);
        session.agent.close().await;
        tracing::info!(session_id, "Session closed");
        Ok(())
    }

    pub fn resolve_question(
        &self,
        session_id: &str,
        answers: HashMap<String, String>,
    ) -> Result<bool, WorkerError> {
        self.lookup(session_id)?;
        self.interactions.resolve_question(session_id, answers)
    }

    pub fn resolve_plan(&self, session_id: &str, approved: bool) -> Result<bool, WorkerError> {
        self.lookup(session_id)?;
        self.interactions.resolve_plan(session_id, approved)
    }

    pub fn pending(&self, session_id: &str) -> Option<PendingInfo> {
        self.interactions.pending(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionSnapshot, WorkerError> {
        let session = self.lookup(session_id)?;
        Ok(session.snapshot(self.pending(session_id)))
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot(self.pending(entry.key())))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Cached conversations with no live session attached.
    pub async fn discoverable(&self) -> Result<Vec<CachedConversation>, WorkerError> {
        let Some(cache) = &self.cache else {
            return Ok(Vec::new());
        };
        let active: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().conversation_id())
            .collect();
        Ok(cache
            .list()
            .await?
            .into_iter()
            .filter(|c| !active.contains(&c.conversation_id))
            .collect())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }
}

async fn pump_turn(
    session: Arc<WorkerSession>,
    cache: Option<TranscriptCache>,
    tx: mpsc::Sender<WireEvent>,
) {
    // Holding the notice receiver also serializes overlapping turns.
    let mut notices = session.notices.lock().await;
    let mut first_message = true;

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                if let Some(reason) = session.with_state(|s| s.closed_with.clone()) {
                    let _ = tx.send(WireEvent::Error(reason)).await;
                }
                break;
            }
            next = session.agent.next_message() => match next {
                Some(Ok(message)) => {
                    if first_message {
                        first_message = false;
                        apply_pending_mode(&session).await;
                    }
                    record_message(&session, cache.as_ref(), &message).await;
                    let done = message.is_result();
                    // A closed receiver means the client went away; keep draining.
                    let _ = tx.send(WireEvent::Sdk(message)).await;
                    if done {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Agent stream failed");
                    let _ = tx
                        .send(WireEvent::Error(StreamError::new(codes::AGENT_ERROR, e.to_string())))
                        .await;
                    break;
                }
                None => {
                    if !session.cancel.is_cancelled() {
                        let _ = tx
                            .send(WireEvent::Error(StreamError::new(
                                codes::AGENT_ERROR,
                                "Agent session ended unexpectedly",
                            )))
                            .await;
                    }
                    break;
                }
            },
            Some(notice) = notices.recv() => {
                let _ = tx.send(notice).await;
            }
        }
    }

    session.with_state(|s| {
        if s.status != SessionStatus::Closed {
            s.status = SessionStatus::Idle;
        }
        s.last_activity_at = Utc::now();
    });
}

async fn apply_pending_mode(session: &WorkerSession) {
    let Some(mode) = session.with_state(|s| s.pending_mode.take()) else {
        return;
    };
    if let Err(e) = session.agent.set_permission_mode(mode).await {
        tracing::warn!(session_id = %session.id, mode = %mode, error = %e, "Failed to apply permission mode");
    }
}

async fn record_message(
    session: &WorkerSession,
    cache: Option<&TranscriptCache>,
    message: &SdkMessage,
) {
    let conversation_id = session.with_state(|s| {
        if let Some(id) = message.session_id() {
            s.conversation_id = Some(id.to_string());
        }
        s.last_activity_at = Utc::now();
        s.conversation_id.clone()
    });
    if let (Some(cache), Some(conversation_id)) = (cache, conversation_id)
        && let Err(e) = cache.append(&conversation_id, message).await
    {
        tracing::debug!(session_id = %session.id, error = %e, "Transcript cache append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{ASK_USER_QUESTION, PLAN_REJECTED_MESSAGE};
    use crate::runtime::scripted::{ScriptStep, ScriptedRuntime};
    use agentdock_common::ContentBlock;
    use agentdock_common::message::UserContent;
    use serde_json::json;
    use std::time::Duration;

    fn manager(runtime: ScriptedRuntime) -> WorkerSessionManager {
        WorkerSessionManager::new(Arc::new(runtime), "/workspace", None)
    }

    async fn collect(mut rx: mpsc::Receiver<WireEvent>) -> Vec<WireEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    fn request(prompt: &str) -> CreateSession {
        CreateSession {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_streams_one_turn_then_goes_idle() {
        let mgr = manager(ScriptedRuntime::echo());
        let created = mgr.create(request("add a test")).await.unwrap();
        assert!(!created.resumed);
        assert_eq!(created.session.status(), SessionStatus::Streaming);

        let events = collect(mgr.stream(created.session.clone())).await;
        assert_eq!(events.last().unwrap().event_type(), "result");
        assert_eq!(events.iter().filter(|e| e.event_type() == "result").count(), 1);

        assert_eq!(created.session.status(), SessionStatus::Idle);
        assert!(created.session.conversation_id().unwrap().starts_with("conv-"));
    }

    #[tokio::test]
    async fn build_and_plan_modes_shape_options() {
        let runtime = ScriptedRuntime::echo();
        let mgr = manager(runtime.clone());
        mgr.create(request("build")).await.unwrap();
        mgr.create(CreateSession {
            prompt: "plan".into(),
            mode: SessionMode::Plan,
            ..Default::default()
        })
        .await
        .unwrap();

        let opened = runtime.log().opened;
        assert_eq!(opened[0].permission_mode, PermissionMode::BypassPermissions);
        assert!(opened[0].allowed_tools.is_none());
        assert_eq!(opened[1].permission_mode, PermissionMode::Plan);
        let tools = opened[1].allowed_tools.as_ref().unwrap();
        assert!(tools.iter().any(|t| t == "ExitPlanMode"));
        assert!(!tools.iter().any(|t| t == "Bash"));
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_not_found() {
        let mgr = manager(ScriptedRuntime::echo());
        let Err(err) = mgr.send("ws-missing", "hi", None, None).await else {
            panic!("send to an unknown session should fail");
        };
        assert!(matches!(err, WorkerError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn mode_override_applies_once_after_first_message() {
        let runtime = ScriptedRuntime::echo();
        let mgr = manager(runtime.clone());
        let created = mgr.create(request("one")).await.unwrap();
        collect(mgr.stream(created.session.clone())).await;
        assert!(runtime.log().permission_modes.is_empty());

        let session = mgr
            .send(&created.session.id, "two", None, Some(PermissionMode::AcceptEdits))
            .await
            .unwrap();
        collect(mgr.stream(session)).await;
        assert_eq!(runtime.log().permission_modes, vec![PermissionMode::AcceptEdits]);

        let session = mgr.send(&created.session.id, "three", None, None).await.unwrap();
        collect(mgr.stream(session)).await;
        assert_eq!(runtime.log().permission_modes.len(), 1);
        assert_eq!(
            mgr.get(&created.session.id).unwrap().permission_mode,
            PermissionMode::AcceptEdits
        );
    }

    #[tokio::test]
    async fn resume_of_live_conversation_reuses_session() {
        let runtime = ScriptedRuntime::echo();
        let mgr = manager(runtime.clone());
        let created = mgr.create(request("first")).await.unwrap();
        collect(mgr.stream(created.session.clone())).await;
        let conversation = created.session.conversation_id().unwrap();

        let again = mgr
            .create(CreateSession {
                prompt: "second".into(),
                resume_id: Some(conversation),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(again.resumed);
        assert_eq!(again.session.id, created.session.id);
        assert_eq!(runtime.opened(), 1);
        collect(mgr.stream(again.session)).await;
    }

    #[tokio::test]
    async fn question_pauses_stream_until_answered() {
        let runtime = ScriptedRuntime::new(|_| {
            vec![
                ScriptStep::Tool {
                    name: ASK_USER_QUESTION.into(),
                    input: json!({"questions": [{"question": "Which DB?"}]}),
                },
                ScriptStep::Text("done".into()),
            ]
        });
        let mgr = Arc::new(manager(runtime));
        let created = mgr.create(request("ask me")).await.unwrap();
        let id = created.session.id.clone();
        let mut rx = mgr.stream(created.session);

        loop {
            let ev = rx.recv().await.unwrap();
            if ev.event_type() == "question_pending" {
                break;
            }
        }
        assert!(mgr.get(&id).unwrap().pending.is_some());
        assert_eq!(mgr.get(&id).unwrap().status, SessionStatus::Streaming);

        let answers = HashMap::from([("Which DB?".to_string(), "pg".to_string())]);
        assert!(mgr.resolve_question(&id, answers.clone()).unwrap());
        assert!(!mgr.resolve_question(&id, answers).unwrap());

        let rest = collect(rx).await;
        let tool_result = rest.iter().find_map(|e| match e {
            WireEvent::Sdk(SdkMessage::User(u)) => match &u.message.content {
                UserContent::Blocks(blocks) => blocks.first().cloned(),
                _ => None,
            },
            _ => None,
        });
        let Some(ContentBlock::ToolResult { content, is_error, .. }) = tool_result else {
            panic!("Expected tool result");
        };
        assert!(!is_error);
        assert!(content.as_str().unwrap().contains("pg"));
        assert_eq!(rest.last().unwrap().event_type(), "result");
    }

    #[tokio::test]
    async fn rejected_plan_reports_denial() {
        let runtime = ScriptedRuntime::new(|_| {
            vec![ScriptStep::Tool {
                name: "ExitPlanMode".into(),
                input: json!({"plan": "rewrite everything"}),
            }]
        });
        let mgr = manager(runtime);
        let created = mgr.create(request("plan it")).await.unwrap();
        let id = created.session.id.clone();
        let mut rx = mgr.stream(created.session);
        while rx.recv().await.unwrap().event_type() != "plan_pending" {}

        assert!(mgr.resolve_plan(&id, false).unwrap());
        let rest = collect(rx).await;
        let denied = rest.iter().any(|e| match e {
            WireEvent::Sdk(SdkMessage::User(u)) => matches!(
                &u.message.content,
                UserContent::Blocks(b) if matches!(
                    &b[0],
                    ContentBlock::ToolResult { is_error: true, content, .. }
                        if content.as_str() == Some(PLAN_REJECTED_MESSAGE)
                )
            ),
            _ => false,
        });
        assert!(denied);
    }

    #[tokio::test]
    async fn close_rejects_pending_interaction_and_ends_stream() {
        let runtime = ScriptedRuntime::new(|_| {
            vec![ScriptStep::Tool {
                name: ASK_USER_QUESTION.into(),
                input: json!({"questions": []}),
            }]
        });
        let mgr = manager(runtime.clone());
        let created = mgr.create(request("ask")).await.unwrap();
        let session = created.session.clone();
        let id = session.id.clone();
        let mut rx = mgr.stream(created.session);
        while rx.recv().await.unwrap().event_type() != "question_pending" {}

        mgr.close(&id).await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("stream should end after close");
        assert!(rest.iter().all(|e| e.event_type() != "result"));
        let Some(WireEvent::Error(err)) = rest.last() else {
            panic!("Expected a terminal error event, got {:?}", rest.last());
        };
        assert_eq!(err.code, codes::INTERACTION_REJECTED);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(mgr.pending(&id).is_none());
        assert!(matches!(mgr.get(&id), Err(WorkerError::SessionNotFound { .. })));
        assert_eq!(runtime.log().closed, 1);
    }

    #[tokio::test]
    async fn close_mid_turn_reports_session_closed() {
        let mgr = manager(ScriptedRuntime::new(|_| {
            vec![
                ScriptStep::Text("working".into()),
                ScriptStep::Delay(Duration::from_secs(30)),
            ]
        }));
        let created = mgr.create(request("go")).await.unwrap();
        let id = created.session.id.clone();
        let mut rx = mgr.stream(created.session);
        while rx.recv().await.unwrap().event_type() != "assistant" {}

        mgr.close(&id).await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("stream should end after close");
        let Some(WireEvent::Error(err)) = rest.last() else {
            panic!("Expected a terminal error event, got {:?}", rest.last());
        };
        assert_eq!(err.code, codes::SESSION_CLOSED);
    }

    #[tokio::test]
    async fn interrupt_ends_the_turn_and_keeps_the_session() {
        let runtime = ScriptedRuntime::new(|turn| {
            if turn.turn == 1 {
                vec![
                    ScriptStep::Text("starting".into()),
                    ScriptStep::Delay(Duration::from_secs(30)),
                    ScriptStep::Text("never sent".into()),
                ]
            } else {
                vec![ScriptStep::Text(format!("Echo: {}", turn.prompt))]
            }
        });
        let mgr = manager(runtime.clone());
        let created = mgr.create(request("long job")).await.unwrap();
        let id = created.session.id.clone();
        let mut rx = mgr.stream(created.session.clone());
        while rx.recv().await.unwrap().event_type() != "assistant" {}

        mgr.interrupt(&id).await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("interrupted turn should end");
        let Some(WireEvent::Sdk(SdkMessage::Result(result))) = rest.last() else {
            panic!("Expected a result, got {:?}", rest.last());
        };
        assert_eq!(result.subtype, "interrupted");
        assert!(result.is_error);
        assert_eq!(created.session.status(), SessionStatus::Idle);
        assert_eq!(runtime.log().interrupts, 1);

        let session = mgr.send(&id, "again", None, None).await.unwrap();
        let events = collect(mgr.stream(session)).await;
        let Some(WireEvent::Sdk(SdkMessage::Result(result))) = events.last() else {
            panic!("Expected a result");
        };
        assert_eq!(result.subtype, "success");
        assert_eq!(result.result.as_deref(), Some("Echo: again"));
    }

    #[tokio::test]
    async fn interrupt_rejects_a_pending_question() {
        let runtime = ScriptedRuntime::new(|_| {
            vec![
                ScriptStep::Tool {
                    name: ASK_USER_QUESTION.into(),
                    input: json!({"questions": [{"question": "Which DB?"}]}),
                },
                ScriptStep::Text("unreachable".into()),
            ]
        });
        let mgr = manager(runtime);
        let created = mgr.create(request("ask")).await.unwrap();
        let id = created.session.id.clone();
        let mut rx = mgr.stream(created.session.clone());
        while rx.recv().await.unwrap().event_type() != "question_pending" {}

        mgr.interrupt(&id).await.unwrap();
        assert!(mgr.pending(&id).is_none());
        let answers = HashMap::from([("Which DB?".to_string(), "pg".to_string())]);
        assert!(!mgr.resolve_question(&id, answers).unwrap());

        let rest = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("interrupted turn should end");
        let Some(WireEvent::Sdk(SdkMessage::Result(result))) = rest.last() else {
            panic!("Expected a result, got {:?}", rest.last());
        };
        assert_eq!(result.subtype, "interrupted");
        assert_eq!(created.session.status(), SessionStatus::Idle);
        assert!(mgr.get(&id).is_ok());
    }

    #[tokio::test]
    async fn agent_failure_becomes_error_event_and_session_stays_resumable() {
        let runtime = ScriptedRuntime::new(|turn| {
            if turn.turn == 1 {
                vec![ScriptStep::Fail("overloaded".into())]
            } else {
                vec![ScriptStep::Text("recovered".into())]
            }
        });
        let mgr = manager(runtime);
        let created = mgr.create(request("go")).await.unwrap();
        let events = collect(mgr.stream(created.session.clone())).await;
        let WireEvent::Error(err) = events.last().unwrap() else {
            panic!("Expected error event");
        };
        assert_eq!(err.code, codes::AGENT_ERROR);
        assert_eq!(created.session.status(), SessionStatus::Idle);

        let session = mgr.send(&created.session.id, "retry", None, None).await.unwrap();
        let events = collect(mgr.stream(session)).await;
        assert_eq!(events.last().unwrap().event_type(), "result");
    }

    #[tokio::test]
    async fn dropped_client_does_not_stop_the_turn() {
        let mgr = manager(ScriptedRuntime::new(|_| {
            vec![
                ScriptStep::Delay(Duration::from_millis(30)),
                ScriptStep::Text("finished anyway".into()),
            ]
        }));
        let created = mgr.create(request("go")).await.unwrap();
        drop(mgr.stream(created.session.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while created.session.status() != SessionStatus::Idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("turn should drain without a client");
        assert!(created.session.conversation_id().is_some());
    }

    #[tokio::test]
    async fn discoverable_excludes_live_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscriptCache::new(dir.path());
        cache
            .append("conv-old", &SdkMessage::assistant_text(None, "x", Some("conv-old")))
            .await
            .unwrap();
        let mgr = WorkerSessionManager::new(
            Arc::new(ScriptedRuntime::echo()),
            "/workspace",
            Some(cache),
        );
        let created = mgr.create(request("hi")).await.unwrap();
        collect(mgr.stream(created.session.clone())).await;

        let found = mgr.discoverable().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conversation_id, "conv-old");
        assert_eq!(mgr.list().len(), 1);
    }
}
