//! Deterministic agent runtime.
//!
//! Produces the same message shapes as the CLI (partial stream events followed
//! by the full assistant message, tool results, one `result` per turn) from a
//! script, so the worker and orchestrator can be exercised without a model.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use agentdock_common::message::{
    ApiMessage, AssistantMessage, BlockDelta, RawStreamEvent, ResultMessage, SystemMessage,
    UserContent, UserMessage, UserPayload,
};
use agentdock_common::{ContentBlock, PermissionMode, SdkMessage};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, Notify, mpsc};

use super::{AgentRuntime, AgentSession, PermissionDecision, SessionOptions, ToolGate, ToolRequest};
use crate::error::WorkerError;

const DELTA_CHUNK_CHARS: usize = 8;

/// What the script sees when deciding a turn.
#[derive(Debug, Clone)]
pub struct ScriptTurn {
    /// 1-based turn number within this session.
    pub turn: usize,
    pub prompt: String,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a message verbatim.
    Message(SdkMessage),
    /// Stream a text block as deltas, then the full assistant message.
    Text(String),
    /// Call a tool through the gate and report its result.
    Tool { name: String, input: Value },
    /// Pause the turn; an interrupt cuts it short.
    Delay(Duration),
    /// Fail the stream without a result.
    Fail(String),
}

pub type Script = Arc<dyn Fn(&ScriptTurn) -> Vec<ScriptStep> + Send + Sync>;

/// Calls observed by the runtime, for assertions.
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    pub opened: Vec<SessionOptions>,
    pub prompts: Vec<String>,
    pub permission_modes: Vec<PermissionMode>,
    pub models: Vec<String>,
    pub interrupts: usize,
    pub closed: usize,
}

#[derive(Clone)]
pub struct ScriptedRuntime {
    script: Script,
    log: Arc<StdMutex<ScriptLog>>,
}

impl ScriptedRuntime {
    pub fn new(script: impl Fn(&ScriptTurn) -> Vec<ScriptStep> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(StdMutex::new(ScriptLog::default())),
        }
    }

    /// Replies to every prompt with `Echo: {prompt}`.
    pub fn echo() -> Self {
        Self::new(|turn| vec![ScriptStep::Text(format!("Echo: {}", turn.prompt))])
    }

    pub fn log(&self) -> ScriptLog {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn opened(&self) -> usize {
        self.log().opened.len()
    }
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::echo()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn open(
        &self,
        options: SessionOptions,
        gate: Arc<dyn ToolGate>,
    ) -> Result<Arc<dyn AgentSession>, WorkerError> {
        if let Ok(mut log) = self.log.lock() {
            log.opened.push(options.clone());
        }
        let conversation_id = options
            .resume
            .clone()
            .unwrap_or_else(|| format!("conv-{}", uuid::Uuid::new_v4()));
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Arc::new(ScriptedSession {
            shared: Arc::new(Shared {
                script: self.script.clone(),
                log: self.log.clone(),
                gate,
                conversation_id,
                state: StdMutex::new(TurnState {
                    permission_mode: options.permission_mode,
                    model: options.model.clone(),
                }),
                options,
                turns: AtomicUsize::new(0),
                interrupted: AtomicBool::new(false),
                interrupt_notify: Notify::new(),
                turn_lock: Mutex::new(()),
                tx,
            }),
            rx: Mutex::new(rx),
        }))
    }
}

struct TurnState {
    permission_mode: PermissionMode,
    model: Option<String>,
}

struct Shared {
    script: Script,
    log: Arc<StdMutex<ScriptLog>>,
    gate: Arc<dyn ToolGate>,
    options: SessionOptions,
    conversation_id: String,
    state: StdMutex<TurnState>,
    turns: AtomicUsize,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
    turn_lock: Mutex<()>,
    tx: mpsc::UnboundedSender<Result<SdkMessage, WorkerError>>,
}

struct ScriptedSession {
    shared: Arc<Shared>,
    rx: Mutex<mpsc::UnboundedReceiver<Result<SdkMessage, WorkerError>>>,
}

impl Shared {
    fn emit(&self, msg: SdkMessage) {
        let _ = self.tx.send(Ok(msg));
    }

    fn conv(&self) -> Option<&str> {
        Some(self.conversation_id.as_str())
    }

    async fn run_turn(self: Arc<Self>, prompt: String) {
        let _turn = self.turn_lock.lock().await;
        self.interrupted.store(false, Ordering::SeqCst);
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        let (permission_mode, model) = match self.state.lock() {
            Ok(s) => (s.permission_mode, s.model.clone()),
            Err(_) => (self.options.permission_mode, self.options.model.clone()),
        };

        if turn == 1 {
            let mut extra = Map::new();
            extra.insert("cwd".into(), json!(self.options.cwd));
            extra.insert("permissionMode".into(), json!(permission_mode.as_str()));
            if let Some(model) = &model {
                extra.insert("model".into(), json!(model));
            }
            self.emit(SdkMessage::System(SystemMessage {
                subtype: "init".into(),
                session_id: Some(self.conversation_id.clone()),
                extra,
            }));
        }

        let steps = (self.script)(&ScriptTurn {
            turn,
            prompt,
            permission_mode,
            model,
        });

        let mut last_text = None;
        for (step_index, step) in steps.into_iter().enumerate() {
            if self.interrupted.load(Ordering::SeqCst) {
                self.finish(turn, started, "interrupted", true, None);
                return;
            }
            match step {
                ScriptStep::Message(msg) => self.emit(msg),
                ScriptStep::Text(text) => {
                    self.stream_text(&format!("msg_{}_{}", turn, step_index), &text);
                    last_text = Some(text);
                }
                ScriptStep::Tool { name, input } => {
                    let tool_use_id = format!("toolu_{}_{}", turn, step_index);
                    if let Err(e) = self.call_tool(turn, step_index, &tool_use_id, name, input).await {
                        if self.interrupted.load(Ordering::SeqCst) {
                            self.finish(turn, started, "interrupted", true, None);
                        } else {
                            let _ = self.tx.send(Err(e));
                        }
                        return;
                    }
                }
                ScriptStep::Delay(duration) => {
                    // Registered before the flag check so a racing interrupt still wakes it.
                    let notified = self.interrupt_notify.notified();
                    if !self.interrupted.load(Ordering::SeqCst) {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = notified => {}
                        }
                    }
                }
                ScriptStep::Fail(reason) => {
                    let _ = self.tx.send(Err(WorkerError::AgentStream(reason)));
                    return;
                }
            }
        }

        if self.interrupted.load(Ordering::SeqCst) {
            self.finish(turn, started, "interrupted", true, None);
        } else {
            self.finish(turn, started, "success", false, last_text);
        }
    }

    fn stream_text(&self, message_id: &str, text: &str) {
        self.emit(SdkMessage::stream(
            RawStreamEvent::MessageStart {
                message: ApiMessage {
                    id: Some(message_id.to_string()),
                    ..Default::default()
                },
            },
            self.conv(),
        ));
        self.emit(SdkMessage::stream(
            RawStreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text {
                    text: String::new(),
                },
            },
            self.conv(),
        ));
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(DELTA_CHUNK_CHARS) {
            self.emit(SdkMessage::stream(
                RawStreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::TextDelta {
                        text: chunk.iter().collect(),
                    },
                },
                self.conv(),
            ));
        }
        self.emit(SdkMessage::stream(
            RawStreamEvent::ContentBlockStop { index: 0 },
            self.conv(),
        ));
        self.emit(SdkMessage::stream(RawStreamEvent::MessageStop, self.conv()));
        self.emit(SdkMessage::assistant_text(Some(message_id), text, self.conv()));
    }

    async fn call_tool(
        &self,
        turn: usize,
        step_index: usize,
        tool_use_id: &str,
        name: String,
        input: Value,
    ) -> Result<(), WorkerError> {
        self.emit(SdkMessage::Assistant(AssistantMessage {
            message: ApiMessage {
                id: Some(format!("msg_{}_{}", turn, step_index)),
                model: None,
                content: vec![ContentBlock::ToolUse {
                    id: tool_use_id.to_string(),
                    name: name.clone(),
                    input: input.clone(),
                }],
            },
            session_id: Some(self.conversation_id.clone()),
            parent_tool_use_id: None,
        }));

        let decision = self
            .gate
            .can_use_tool(ToolRequest {
                tool_name: name,
                input,
                tool_use_id: Some(tool_use_id.to_string()),
            })
            .await?;

        let (content, is_error) = match decision {
            PermissionDecision::Allow { updated_input } => (
                Value::String(serde_json::to_string(&updated_input).unwrap_or_default()),
                false,
            ),
            PermissionDecision::Deny { message } => (Value::String(message), true),
        };
        self.emit(SdkMessage::User(UserMessage {
            message: UserPayload {
                role: "user".into(),
                content: UserContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content,
                    is_error,
                }]),
            },
            session_id: Some(self.conversation_id.clone()),
            parent_tool_use_id: None,
        }));
        Ok(())
    }

    fn finish(
        &self,
        turn: usize,
        started: Instant,
        subtype: &str,
        is_error: bool,
        result: Option<String>,
    ) {
        self.emit(SdkMessage::Result(ResultMessage {
            subtype: subtype.to_string(),
            is_error,
            duration_ms: started.elapsed().as_millis() as u64,
            num_turns: turn as u32,
            total_cost_usd: Some(0.0),
            result,
            session_id: Some(self.conversation_id.clone()),
        }));
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn send(&self, message: &str) -> Result<(), WorkerError> {
        if self.shared.tx.is_closed() {
            return Err(WorkerError::AgentStream("scripted session closed".into()));
        }
        if let Ok(mut log) = self.shared.log.lock() {
            log.prompts.push(message.to_string());
        }
        tokio::spawn(self.shared.clone().run_turn(message.to_string()));
        Ok(())
    }

    async fn next_message(&self) -> Option<Result<SdkMessage, WorkerError>> {
        self.rx.lock().await.recv().await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), WorkerError> {
        if let Ok(mut state) = self.shared.state.lock() {
            state.permission_mode = mode;
        }
        if let Ok(mut log) = self.shared.log.lock() {
            log.permission_modes.push(mode);
        }
        Ok(())
    }

    async fn set_model(&self, model: &str) -> Result<(), WorkerError> {
        if let Ok(mut state) = self.shared.state.lock() {
            state.model = Some(model.to_string());
        }
        if let Ok(mut log) = self.shared.log.lock() {
            log.models.push(model.to_string());
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.interrupt_notify.notify_waiters();
        if let Ok(mut log) = self.shared.log.lock() {
            log.interrupts += 1;
        }
        Ok(())
    }

    async fn close(&self) {
        self.rx.lock().await.close();
        if let Ok(mut log) = self.shared.log.lock() {
            log.closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct AllowAll;

    #[async_trait]
    impl ToolGate for AllowAll {
        async fn can_use_tool(&self, request: ToolRequest) -> Result<PermissionDecision, WorkerError> {
            Ok(PermissionDecision::Allow {
                updated_input: request.input,
            })
        }
    }

    fn options(resume: Option<&str>) -> SessionOptions {
        SessionOptions {
            cwd: PathBuf::from("/workspace"),
            model: None,
            permission_mode: PermissionMode::BypassPermissions,
            allowed_tools: None,
            system_prompt: None,
            resume: resume.map(str::to_string),
        }
    }

    async fn drain_turn(session: &Arc<dyn AgentSession>) -> Vec<SdkMessage> {
        let mut out = Vec::new();
        while let Some(msg) = session.next_message().await {
            let msg = msg.unwrap();
            let done = msg.is_result();
            out.push(msg);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn echo_streams_then_finishes_with_one_result() {
        let runtime = ScriptedRuntime::echo();
        let session = runtime.open(options(None), Arc::new(AllowAll)).await.unwrap();
        session.send("add a test").await.unwrap();

        let messages = drain_turn(&session).await;
        assert_eq!(messages.first().unwrap().event_type(), "system");
        assert!(messages.iter().any(|m| m.event_type() == "stream_event"));
        assert!(messages.iter().any(|m| m.event_type() == "assistant"));
        let results: Vec<_> = messages.iter().filter(|m| m.is_result()).collect();
        assert_eq!(results.len(), 1);
        let SdkMessage::Result(r) = results[0] else {
            unreachable!()
        };
        assert!(!r.is_error);
        assert_eq!(r.result.as_deref(), Some("Echo: add a test"));
        assert_eq!(runtime.opened(), 1);
    }

    #[tokio::test]
    async fn resume_reuses_conversation_id() {
        let runtime = ScriptedRuntime::echo();
        let session = runtime
            .open(options(Some("conv-prev")), Arc::new(AllowAll))
            .await
            .unwrap();
        session.send("again").await.unwrap();
        let messages = drain_turn(&session).await;
        assert!(messages.iter().all(|m| m.session_id() == Some("conv-prev")));
    }

    #[tokio::test]
    async fn interrupt_ends_turn_with_interrupted_result() {
        let runtime = ScriptedRuntime::new(|_| {
            vec![
                ScriptStep::Delay(Duration::from_secs(30)),
                ScriptStep::Text("never".into()),
            ]
        });
        let session = runtime.open(options(None), Arc::new(AllowAll)).await.unwrap();
        session.send("slow").await.unwrap();
        // Skip the init message so the turn is known to be in progress.
        let first = session.next_message().await.unwrap().unwrap();
        assert_eq!(first.event_type(), "system");
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.interrupt().await.unwrap();

        let messages = drain_turn(&session).await;
        let SdkMessage::Result(r) = messages.last().unwrap() else {
            panic!("Expected result");
        };
        assert_eq!(r.subtype, "interrupted");
        assert!(!messages.iter().any(|m| m.event_type() == "assistant"));
        assert_eq!(runtime.log().interrupts, 1);
    }

    #[tokio::test]
    async fn fail_step_surfaces_stream_error() {
        let runtime = ScriptedRuntime::new(|_| vec![ScriptStep::Fail("model overloaded".into())]);
        let session = runtime.open(options(None), Arc::new(AllowAll)).await.unwrap();
        session.send("x").await.unwrap();
        let _init = session.next_message().await.unwrap().unwrap();
        let err = session.next_message().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }
}
