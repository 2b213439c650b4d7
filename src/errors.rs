//! Typed error hierarchy for the orchestrator.
//!
//! Three top-level enums cover the three layers:
//! - `WorkspaceError`: per-issue directories and git state
//! - `BackendError`: compute-unit lifecycle
//! - `ExecutionError`: session operations, wrapping the two above

use agentdock_common::wire::codes;
use thiserror::Error;

/// Errors from preparing an issue's workspace. Surfaced before any compute
/// unit is touched and never retried automatically.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Invalid {kind} id '{id}': only letters, digits, '.', '_' and '-' are allowed")]
    InvalidId { kind: &'static str, id: String },

    #[error("No workspace for issue {issue_id}")]
    NotFound { issue_id: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a compute backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The unit never became healthy. Terminal for this call; a later call
    /// will try to create it again.
    #[error("Compute unit for issue {issue_id} failed to provision: {reason}")]
    Provisioning { issue_id: String, reason: String },

    /// Detected during `ensure_running` and handled there by replacement.
    #[error("Compute unit {unit} is unhealthy")]
    Unhealthy { unit: String },

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// Errors from the execution service.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Worker returned {status}: {message}")]
    Worker { status: u16, message: String },

    #[error("Worker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed worker stream: {0}")]
    Protocol(String),
}

impl ExecutionError {
    pub fn session_not_found(session_id: &str) -> Self {
        ExecutionError::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    /// Code used in terminal `error` stream events.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Workspace(_) => codes::WORKSPACE_FAILED,
            ExecutionError::Backend(_) => codes::PROVISIONING_FAILED,
            ExecutionError::SessionNotFound { .. } => codes::SESSION_NOT_FOUND,
            ExecutionError::Worker { status: 404, .. } => codes::SESSION_NOT_FOUND,
            ExecutionError::Worker { .. } | ExecutionError::Transport(_) => codes::UPSTREAM_ERROR,
            ExecutionError::Protocol(_) => codes::AGENT_ERROR,
        }
    }
}
