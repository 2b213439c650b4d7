//! Events carried on a session's SSE stream.
//!
//! The SSE `event:` name is the discriminator. SDK messages keep their own
//! `type` field inside `data`; lifecycle events (`session_started`,
//! `question_pending`, `plan_pending`, `error`) are worker-originated payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::SdkMessage;
use crate::sse::SseFrame;

/// Error codes reported in terminal `error` events and API error bodies.
pub mod codes {
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const INTERACTION_REJECTED: &str = "INTERACTION_REJECTED";
    pub const SESSION_CLOSED: &str = "SESSION_CLOSED";
    pub const PROVISIONING_FAILED: &str = "PROVISIONING_FAILED";
    pub const WORKSPACE_FAILED: &str = "WORKSPACE_FAILED";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed '{event}' payload: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode '{event}' event: {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub questions: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPlan {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub code: String,
    pub message: String,
}

impl StreamError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Everything a worker may put on a session stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Sdk(SdkMessage),
    SessionStarted(SessionStarted),
    QuestionPending(PendingQuestion),
    PlanPending(PendingPlan),
    Error(StreamError),
}

impl WireEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WireEvent::Sdk(msg) => msg.event_type(),
            WireEvent::SessionStarted(_) => "session_started",
            WireEvent::QuestionPending(_) => "question_pending",
            WireEvent::PlanPending(_) => "plan_pending",
            WireEvent::Error(_) => "error",
        }
    }

    /// True for events after which no more events arrive for the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WireEvent::Sdk(SdkMessage::Result(_)) | WireEvent::Error(_))
    }

    pub fn to_frame(&self) -> Result<SseFrame, ProtocolError> {
        let event = self.event_type();
        let data = match self {
            WireEvent::Sdk(msg) => serde_json::to_string(msg),
            WireEvent::SessionStarted(p) => serde_json::to_string(p),
            WireEvent::QuestionPending(p) => serde_json::to_string(p),
            WireEvent::PlanPending(p) => serde_json::to_string(p),
            WireEvent::Error(p) => serde_json::to_string(p),
        }
        .map_err(|source| ProtocolError::Encode {
            event: event.to_string(),
            source,
        })?;
        Ok(SseFrame::new(event, data))
    }

    /// Decode a frame. Unknown event names yield `Ok(None)` so newer workers
    /// can add event kinds without breaking older orchestrators.
    pub fn from_frame(frame: &SseFrame) -> Result<Option<Self>, ProtocolError> {
        let malformed = |source| ProtocolError::MalformedPayload {
            event: frame.event.clone(),
            source,
        };
        let event = match frame.event.as_str() {
            "system" | "assistant" | "user" | "result" | "stream_event" => {
                WireEvent::Sdk(serde_json::from_str(&frame.data).map_err(malformed)?)
            }
            "session_started" => {
                WireEvent::SessionStarted(serde_json::from_str(&frame.data).map_err(malformed)?)
            }
            "question_pending" => {
                WireEvent::QuestionPending(serde_json::from_str(&frame.data).map_err(malformed)?)
            }
            "plan_pending" => {
                WireEvent::PlanPending(serde_json::from_str(&frame.data).map_err(malformed)?)
            }
            "error" => WireEvent::Error(serde_json::from_str(&frame.data).map_err(malformed)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
