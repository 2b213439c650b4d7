//! Agent runtime seam.
//!
//! The worker never talks to a model directly: it opens an [`AgentSession`]
//! through an [`AgentRuntime`] and pulls [`SdkMessage`]s from it. Tool calls
//! are routed back through a [`ToolGate`] so the worker can pause them for a
//! human decision.
//!
//! Real implementation: [`claude::ClaudeCliRuntime`]. Deterministic double:
//! [`scripted::ScriptedRuntime`].

pub mod claude;
pub mod scripted;

use std::path::PathBuf;
use std::sync::Arc;

use agentdock_common::{PermissionMode, SdkMessage};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkerError;

/// Everything needed to open (or resume) one agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    /// Conversation handle to resume instead of starting fresh.
    pub resume: Option<String>,
}

/// A tool call awaiting permission.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow { updated_input: Value },
    Deny { message: String },
}

/// Decides whether a tool call may proceed. May suspend indefinitely.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn can_use_tool(&self, request: ToolRequest) -> Result<PermissionDecision, WorkerError>;
}

/// One live conversation with the agent.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Queue a user message; output arrives through `next_message`.
    async fn send(&self, message: &str) -> Result<(), WorkerError>;

    /// Next message from the agent, `None` once the session has ended.
    async fn next_message(&self) -> Option<Result<SdkMessage, WorkerError>>;

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), WorkerError>;

    async fn set_model(&self, model: &str) -> Result<(), WorkerError>;

    /// Stop the current turn; the session stays usable.
    async fn interrupt(&self) -> Result<(), WorkerError>;

    async fn close(&self);
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn open(
        &self,
        options: SessionOptions,
        gate: Arc<dyn ToolGate>,
    ) -> Result<Arc<dyn AgentSession>, WorkerError>;
}
