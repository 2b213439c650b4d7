//! Shared wire protocol for agentdock.
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `message` | `SdkMessage` union emitted by the agent runtime         |
//! | `mode`    | `PermissionMode`, `SessionMode`, plan-mode tool list    |
//! | `sse`     | `SseFrame` encoding and the incremental `SseDecoder`    |
//! | `wire`    | `WireEvent`: SDK messages plus worker lifecycle events  |
//! | `bridge`  | `StreamBridge`: partial-message reconstruction          |

pub mod bridge;
pub mod message;
pub mod mode;
pub mod sse;
pub mod wire;

pub use bridge::{BridgeOutput, StreamBridge, TurnSummary};
pub use message::{ContentBlock, SdkMessage};
pub use mode::{PermissionMode, SessionMode};
pub use sse::{SseDecoder, SseFrame};
pub use wire::{ProtocolError, StreamError, WireEvent};
