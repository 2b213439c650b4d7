//! Agent runtime backed by the `claude` CLI in bidirectional stream-json mode.
//!
//! stdin carries user messages and control requests; stdout carries SDK
//! messages, control responses, and `can_use_tool` control requests, which
//! are answered through the session's [`ToolGate`].

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agentdock_common::{PermissionMode, SdkMessage};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{AgentRuntime, AgentSession, PermissionDecision, SessionOptions, ToolGate, ToolRequest};
use crate::error::WorkerError;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_TAIL_LINES: usize = 20;

/// Spawns one `claude` process per session.
pub struct ClaudeCliRuntime {
    command: String,
}

impl ClaudeCliRuntime {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// CLI arguments for a session.
pub fn build_args(options: &SessionOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
        "--permission-prompt-tool",
        "stdio",
        "--permission-mode",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(options.permission_mode.to_string());

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(prompt) = &options.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(tools) = &options.allowed_tools {
        args.push("--allowedTools".to_string());
        args.push(tools.join(","));
    }
    if let Some(resume) = &options.resume {
        args.push("--resume".to_string());
        args.push(resume.clone());
    }
    args
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn open(
        &self,
        options: SessionOptions,
        gate: Arc<dyn ToolGate>,
    ) -> Result<Arc<dyn AgentSession>, WorkerError> {
        let mut child = Command::new(&self.command)
            .args(build_args(&options))
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().context("agent stdin not captured")?;
        let stdout = child.stdout.take().context("agent stdout not captured")?;
        let stderr = child.stderr.take().context("agent stderr not captured")?;

        let control = Arc::new(ControlChannel::new(stdin));
        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::new()));
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let stderr_task = {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "agent_stderr", "{}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        };

        let reader_task = {
            let control = control.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    route_line(&line, &control, &gate, &messages_tx);
                }
                // Give stderr a moment to flush before reporting.
                let _ = tokio::time::timeout(Duration::from_millis(200), stderr_task).await;
                let tail = stderr_tail
                    .lock()
                    .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                let reason = if tail.is_empty() {
                    "agent process exited".to_string()
                } else {
                    format!("agent process exited: {}", tail)
                };
                let _ = messages_tx.send(Err(WorkerError::AgentStream(reason)));
                control.fail_all("agent process exited").await;
            })
        };

        let session = Arc::new(ClaudeCliSession {
            control,
            messages: Mutex::new(messages_rx),
            child: Mutex::new(Some(child)),
            reader: std::sync::Mutex::new(Some(reader_task)),
        });

        match session.control.request(json!({"subtype": "initialize"})).await {
            Ok(_) => {}
            Err(e) => tracing::warn!("Agent initialize handshake failed: {}", e),
        }

        Ok(session)
    }
}

/// Dispatch one stdout line.
fn route_line(
    line: &str,
    control: &Arc<ControlChannel>,
    gate: &Arc<dyn ToolGate>,
    messages: &mpsc::UnboundedSender<Result<SdkMessage, WorkerError>>,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("Skipping non-JSON agent output: {}", trimmed);
            return;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("control_request") => {
            let control = control.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                control.answer_request(value, gate).await;
            });
        }
        Some("control_response") => {
            let control = control.clone();
            tokio::spawn(async move {
                control.complete(value).await;
            });
        }
        Some("control_cancel_request") | Some("keep_alive") => {}
        _ => match serde_json::from_value::<SdkMessage>(value) {
            Ok(msg) => {
                let _ = messages.send(Ok(msg));
            }
            Err(e) => tracing::debug!("Ignoring unrecognised agent message: {}", e),
        },
    }
}

type ControlReply = Result<Value, String>;

/// Request/response plumbing over the agent's stdin.
struct ControlChannel {
    stdin: Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ControlReply>>>,
    next_id: AtomicU64,
}

impl ControlChannel {
    fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn write_line(&self, value: &Value) -> Result<(), WorkerError> {
        let mut line = serde_json::to_string(value).map_err(|e| anyhow!(e))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| WorkerError::AgentStream("agent stdin closed".into()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, request: Value) -> Result<Value, WorkerError> {
        let id = format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let envelope = json!({"type": "control_request", "request_id": id, "request": request});
        if let Err(e) = self.write_line(&envelope).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(message))) => Err(WorkerError::AgentStream(message)),
            Ok(Err(_)) => Err(WorkerError::AgentStream("control channel closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(WorkerError::AgentStream(format!(
                    "control request {} timed out",
                    id
                )))
            }
        }
    }

    async fn complete(&self, value: Value) {
        let response = &value["response"];
        let Some(id) = response.get("request_id").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(tx) = self.pending.lock().await.remove(id) else {
            return;
        };
        let reply = if response.get("subtype").and_then(|s| s.as_str()) == Some("error") {
            Err(response
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("control request failed")
                .to_string())
        } else {
            Ok(response.get("response").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(reply);
    }

    async fn fail_all(&self, reason: &str) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    /// Answer a request initiated by the agent.
    async fn answer_request(&self, value: Value, gate: Arc<dyn ToolGate>) {
        let request_id = value
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request = &value["request"];

        let response = match request.get("subtype").and_then(|s| s.as_str()) {
            Some("can_use_tool") => {
                let tool_request = ToolRequest {
                    tool_name: request
                        .get("tool_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    input: request.get("input").cloned().unwrap_or_else(|| json!({})),
                    tool_use_id: request
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
                match gate.can_use_tool(tool_request).await {
                    Ok(PermissionDecision::Allow { updated_input }) => json!({
                        "subtype": "success",
                        "request_id": request_id,
                        "response": {"behavior": "allow", "updatedInput": updated_input},
                    }),
                    Ok(PermissionDecision::Deny { message }) => json!({
                        "subtype": "success",
                        "request_id": request_id,
                        "response": {"behavior": "deny", "message": message},
                    }),
                    Err(e) => json!({
                        "subtype": "error",
                        "request_id": request_id,
                        "error": e.to_string(),
                    }),
                }
            }
            other => json!({
                "subtype": "error",
                "request_id": request_id,
                "error": format!("Unsupported control request: {}", other.unwrap_or("none")),
            }),
        };

        let envelope = json!({"type": "control_response", "response": response});
        if let Err(e) = self.write_line(&envelope).await {
            tracing::warn!("Failed to answer agent control request {}: {}", request_id, e);
        }
    }
}

struct ClaudeCliSession {
    control: Arc<ControlChannel>,
    messages: Mutex<mpsc::UnboundedReceiver<Result<SdkMessage, WorkerError>>>,
    child: Mutex<Option<Child>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl AgentSession for ClaudeCliSession {
    async fn send(&self, message: &str) -> Result<(), WorkerError> {
        self.control
            .write_line(&json!({
                "type": "user",
                "message": {"role": "user", "content": message},
                "parent_tool_use_id": null,
            }))
            .await
    }

    async fn next_message(&self) -> Option<Result<SdkMessage, WorkerError>> {
        self.messages.lock().await.recv().await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), WorkerError> {
        self.control
            .request(json!({"subtype": "set_permission_mode", "mode": mode.as_str()}))
            .await
            .map(|_| ())
    }

    async fn set_model(&self, model: &str) -> Result<(), WorkerError> {
        self.control
            .request(json!({"subtype": "set_model", "model": model}))
            .await
            .map(|_| ())
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.control
            .request(json!({"subtype": "interrupt"}))
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        // Dropping stdin lets the CLI exit on its own; the kill covers a hung process.
        self.control.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill agent process: {}", e);
                    }
                }
            }
        }
        if let Ok(mut reader) = self.reader.lock()
            && let Some(handle) = reader.take()
        {
            handle.abort();
        }
        self.control.fail_all("session closed").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options() -> SessionOptions {
        SessionOptions {
            cwd: PathBuf::from("/workspace"),
            model: None,
            permission_mode: PermissionMode::BypassPermissions,
            allowed_tools: None,
            system_prompt: None,
            resume: None,
        }
    }

    #[test]
    fn args_enable_stdio_permission_prompts() {
        let args = build_args(&options());
        let joined = args.join(" ");
        assert!(joined.contains("--input-format stream-json"));
        assert!(joined.contains("--permission-prompt-tool stdio"));
        assert!(joined.contains("--permission-mode bypassPermissions"));
        assert!(!joined.contains("--resume"));
    }

    #[test]
    fn args_carry_resume_model_and_tools() {
        let mut opts = options();
        opts.permission_mode = PermissionMode::Plan;
        opts.model = Some("opus".into());
        opts.resume = Some("conv-7".into());
        opts.allowed_tools = Some(vec!["Read".into(), "Grep".into()]);
        opts.system_prompt = Some("Be brief".into());
        let args = build_args(&opts);

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--resume") + 1], "conv-7");
        assert_eq!(args[pos("--model") + 1], "opus");
        assert_eq!(args[pos("--allowedTools") + 1], "Read,Grep");
        assert_eq!(args[pos("--append-system-prompt") + 1], "Be brief");
        assert_eq!(args[pos("--permission-mode") + 1], "plan");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_with_command() {
        struct AllowAll;
        #[async_trait]
        impl ToolGate for AllowAll {
            async fn can_use_tool(
                &self,
                request: ToolRequest,
            ) -> Result<PermissionDecision, WorkerError> {
                Ok(PermissionDecision::Allow {
                    updated_input: request.input,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.cwd = dir.path().to_path_buf();
        let runtime = ClaudeCliRuntime::new("definitely-not-a-real-agent-binary");
        let err = match runtime.open(opts, Arc::new(AllowAll)).await {
            Ok(_) => panic!("Expected spawn failure"),
            Err(e) => e,
        };
        assert!(matches!(err, WorkerError::Spawn { ref command, .. } if command == "definitely-not-a-real-agent-binary"));
    }
}
