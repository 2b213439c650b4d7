//! Worker error taxonomy and its HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use agentdock_common::wire::codes;
use thiserror::Error;

/// Errors raised by the worker's session layer.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: String },

    #[error("Session {session_id} closed while an interaction was pending")]
    InteractionRejected { session_id: String },

    #[error("Session {session_id} has no pending {expected}")]
    NoPendingInteraction {
        session_id: String,
        expected: &'static str,
    },

    #[error("Failed to spawn agent process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent stream failed: {0}")]
    AgentStream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn not_found(session_id: &str) -> Self {
        WorkerError::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }
}

/// Errors from the allow-listed file reader.
#[derive(Debug, Error)]
pub enum FileAccessError {
    #[error("File {0} not found")]
    NotFound(String),

    #[error("Path {0} is outside the readable roots")]
    Forbidden(String),

    #[error("File {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── HTTP mapping ──────────────────────────────────────────────────────

pub enum ApiError {
    SessionNotFound(String),
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::SessionNotFound(msg) => {
                (StatusCode::NOT_FOUND, codes::SESSION_NOT_FOUND, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, codes::AGENT_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message, "code": code}))).into_response()
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        let msg = err.to_string();
        match err {
            WorkerError::SessionNotFound { .. } => ApiError::SessionNotFound(msg),
            WorkerError::SessionClosed { .. } | WorkerError::NoPendingInteraction { .. } => {
                ApiError::Conflict(msg)
            }
            _ => ApiError::Internal(msg),
        }
    }
}

impl From<FileAccessError> for ApiError {
    fn from(err: FileAccessError) -> Self {
        let msg = err.to_string();
        match err {
            FileAccessError::NotFound(_) => ApiError::NotFound(msg),
            FileAccessError::Forbidden(_) => ApiError::Forbidden(msg),
            FileAccessError::TooLarge { .. } => ApiError::PayloadTooLarge(msg),
            FileAccessError::Io(_) => ApiError::Internal(msg),
        }
    }
}
