//! Messages produced by the agent runtime.
//!
//! `SdkMessage` mirrors the stream-json union emitted by the agent CLI: every
//! line carries a `type` discriminator (`system`, `assistant`, `user`, `result`,
//! `stream_event`). Partial assistant output arrives as `stream_event` wrappers
//! around raw content-block events; see [`crate::bridge`] for reassembly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One message from the agent runtime's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkMessage {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
    StreamEvent(StreamEventMessage),
}

impl SdkMessage {
    /// The wire discriminator, also used as the SSE `event:` name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SdkMessage::System(_) => "system",
            SdkMessage::Assistant(_) => "assistant",
            SdkMessage::User(_) => "user",
            SdkMessage::Result(_) => "result",
            SdkMessage::StreamEvent(_) => "stream_event",
        }
    }

    /// The runtime's resumable conversation handle, when the message carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SdkMessage::System(m) => m.session_id.as_deref(),
            SdkMessage::Assistant(m) => m.session_id.as_deref(),
            SdkMessage::User(m) => m.session_id.as_deref(),
            SdkMessage::Result(m) => m.session_id.as_deref(),
            SdkMessage::StreamEvent(m) => m.session_id.as_deref(),
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, SdkMessage::Result(_))
    }

    /// Convenience constructor for a complete single-text assistant message.
    pub fn assistant_text(message_id: Option<&str>, text: &str, session_id: Option<&str>) -> Self {
        SdkMessage::Assistant(AssistantMessage {
            message: ApiMessage {
                id: message_id.map(str::to_string),
                model: None,
                content: vec![ContentBlock::Text {
                    text: text.to_string(),
                }],
            },
            session_id: session_id.map(str::to_string),
            parent_tool_use_id: None,
        })
    }

    /// Wrap a raw stream event.
    pub fn stream(event: RawStreamEvent, session_id: Option<&str>) -> Self {
        SdkMessage::StreamEvent(StreamEventMessage {
            event,
            session_id: session_id.map(str::to_string),
            parent_tool_use_id: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Fields the orchestrator does not interpret (`model`, `tools`, `cwd`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: ApiMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// The model-level message body shared by assistant messages and `message_start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message: UserPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(default = "default_user_role")]
    pub role: String,
    pub content: UserContent,
}

fn default_user_role() -> String {
    "user".to_string()
}

/// User content is either a bare prompt string or a list of blocks (tool results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Turn terminator: exactly one per turn, always last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventMessage {
    pub event: RawStreamEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

/// Incremental model events, indexed by content-block position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawStreamEvent {
    MessageStart {
        message: ApiMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

/// One unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}
