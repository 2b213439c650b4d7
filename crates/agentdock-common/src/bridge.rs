//! Partial-message reconstruction.
//!
//! `StreamBridge` consumes decoded [`WireEvent`]s for one session and turns
//! them into complete, typed [`BridgeOutput`] items. Content blocks streamed
//! as `content_block_start` / `content_block_delta` / `content_block_stop`
//! are assembled in an index-keyed buffer and emitted on stop; a full
//! assistant message is converted directly when nothing was streamed for it.
//! The buffer lives for one turn and is cleared when the `result` arrives.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{
    AssistantMessage, BlockDelta, ContentBlock, RawStreamEvent, ResultMessage, SdkMessage,
    UserContent,
};
use crate::wire::{PendingPlan, PendingQuestion, SessionStarted, StreamError, WireEvent};

/// Cost and bookkeeping surfaced when a turn terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub conversation_id: Option<String>,
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub num_turns: u32,
}

impl From<&ResultMessage> for TurnSummary {
    fn from(result: &ResultMessage) -> Self {
        Self {
            conversation_id: result.session_id.clone(),
            subtype: result.subtype.clone(),
            is_error: result.is_error,
            result: result.result.clone(),
            total_cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
        }
    }
}

/// A reconstructed, caller-facing item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeOutput {
    SessionStarted(SessionStarted),
    System {
        subtype: String,
        conversation_id: Option<String>,
    },
    Block {
        message_id: Option<String>,
        block: ContentBlock,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: Option<String>,
        content: Value,
        is_error: bool,
    },
    QuestionPending(PendingQuestion),
    PlanPending(PendingPlan),
    TurnComplete(TurnSummary),
    Error(StreamError),
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        initial: Value,
        json: String,
    },
    Opaque(ContentBlock),
}

impl PartialBlock {
    fn start(block: ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => PartialBlock::Text(text),
            ContentBlock::Thinking { thinking, signature } => PartialBlock::Thinking {
                text: thinking,
                signature,
            },
            ContentBlock::ToolUse { id, name, input } => PartialBlock::ToolUse {
                id,
                name,
                initial: input,
                json: String::new(),
            },
            other => PartialBlock::Opaque(other),
        }
    }

    fn apply(&mut self, delta: BlockDelta) {
        match (self, delta) {
            (PartialBlock::Text(text), BlockDelta::TextDelta { text: more }) => {
                text.push_str(&more)
            }
            (PartialBlock::Thinking { text, .. }, BlockDelta::ThinkingDelta { thinking }) => {
                text.push_str(&thinking)
            }
            (PartialBlock::Thinking { signature, .. }, BlockDelta::SignatureDelta { signature: sig }) => {
                signature.get_or_insert_with(String::new).push_str(&sig)
            }
            (PartialBlock::ToolUse { json, .. }, BlockDelta::InputJsonDelta { partial_json }) => {
                json.push_str(&partial_json)
            }
            // Mismatched delta kinds are dropped rather than corrupting the block.
            _ => {}
        }
    }

    fn finish(self) -> ContentBlock {
        match self {
            PartialBlock::Text(text) => ContentBlock::Text { text },
            PartialBlock::Thinking { text, signature } => ContentBlock::Thinking {
                thinking: text,
                signature,
            },
            PartialBlock::ToolUse {
                id,
                name,
                initial,
                json,
            } => {
                let input = if json.trim().is_empty() {
                    if initial.is_null() {
                        Value::Object(Default::default())
                    } else {
                        initial
                    }
                } else {
                    serde_json::from_str(&json).unwrap_or(Value::String(json))
                };
                ContentBlock::ToolUse { id, name, input }
            }
            PartialBlock::Opaque(block) => block,
        }
    }
}

/// Stateful decoder for one session's event stream.
#[derive(Debug, Default)]
pub struct StreamBridge {
    blocks: BTreeMap<usize, PartialBlock>,
    current_message_id: Option<String>,
    streamed_message_ids: HashSet<String>,
    tool_names: HashMap<String, String>,
    conversation_id: Option<String>,
    turn_complete: bool,
}

impl StreamBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest conversation handle observed on any message.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Whether the current turn has been terminated by a result or error.
    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete
    }

    /// Number of content blocks started but not yet stopped.
    pub fn in_progress_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn push(&mut self, event: WireEvent) -> Vec<BridgeOutput> {
        match event {
            WireEvent::Sdk(message) => self.push_message(message),
            WireEvent::SessionStarted(started) => {
                self.turn_complete = false;
                if started.conversation_id.is_some() {
                    self.conversation_id = started.conversation_id.clone();
                }
                vec![BridgeOutput::SessionStarted(started)]
            }
            WireEvent::QuestionPending(q) => vec![BridgeOutput::QuestionPending(q)],
            WireEvent::PlanPending(p) => vec![BridgeOutput::PlanPending(p)],
            WireEvent::Error(err) => {
                self.reset_turn();
                self.turn_complete = true;
                vec![BridgeOutput::Error(err)]
            }
        }
    }

    pub fn push_message(&mut self, message: SdkMessage) -> Vec<BridgeOutput> {
        if let Some(id) = message.session_id() {
            self.conversation_id = Some(id.to_string());
        }
        if !message.is_result() {
            self.turn_complete = false;
        }

        match message {
            SdkMessage::System(sys) => vec![BridgeOutput::System {
                subtype: sys.subtype,
                conversation_id: sys.session_id,
            }],
            SdkMessage::StreamEvent(ev) => self.push_stream_event(ev.event),
            SdkMessage::Assistant(assistant) => self.push_assistant(assistant),
            SdkMessage::User(user) => match user.message.content {
                UserContent::Blocks(blocks) => blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => Some(BridgeOutput::ToolResult {
                            tool_name: self.tool_names.get(&tool_use_id).cloned(),
                            tool_use_id,
                            content,
                            is_error,
                        }),
                        _ => None,
                    })
                    .collect(),
                UserContent::Text(_) => Vec::new(),
            },
            SdkMessage::Result(result) => {
                let summary = TurnSummary::from(&result);
                self.reset_turn();
                self.turn_complete = true;
                vec![BridgeOutput::TurnComplete(summary)]
            }
        }
    }

    fn push_stream_event(&mut self, event: RawStreamEvent) -> Vec<BridgeOutput> {
        match event {
            RawStreamEvent::MessageStart { message } => {
                if let Some(id) = &message.id {
                    self.streamed_message_ids.insert(id.clone());
                }
                self.current_message_id = message.id;
                Vec::new()
            }
            RawStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let ContentBlock::ToolUse { id, name, .. } = &content_block {
                    self.tool_names.insert(id.clone(), name.clone());
                }
                self.blocks.insert(index, PartialBlock::start(content_block));
                Vec::new()
            }
            RawStreamEvent::ContentBlockDelta { index, delta } => {
                if let Some(block) = self.blocks.get_mut(&index) {
                    block.apply(delta);
                }
                Vec::new()
            }
            RawStreamEvent::ContentBlockStop { index } => match self.blocks.remove(&index) {
                Some(block) => vec![BridgeOutput::Block {
                    message_id: self.current_message_id.clone(),
                    block: block.finish(),
                }],
                None => Vec::new(),
            },
            RawStreamEvent::MessageDelta { .. }
            | RawStreamEvent::MessageStop
            | RawStreamEvent::Other => Vec::new(),
        }
    }

    fn push_assistant(&mut self, assistant: AssistantMessage) -> Vec<BridgeOutput> {
        for block in &assistant.message.content {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                self.tool_names.insert(id.clone(), name.clone());
            }
        }

        let already_streamed = assistant
            .message
            .id
            .as_ref()
            .is_some_and(|id| self.streamed_message_ids.contains(id));
        if already_streamed || !self.blocks.is_empty() {
            return Vec::new();
        }

        let message_id = assistant.message.id;
        assistant
            .message
            .content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::Unknown))
            .map(|block| BridgeOutput::Block {
                message_id: message_id.clone(),
                block,
            })
            .collect()
    }

    fn reset_turn(&mut self) {
        self.blocks.clear();
        self.current_message_id = None;
        self.streamed_message_ids.clear();
        self.tool_names.clear();
    }
}
