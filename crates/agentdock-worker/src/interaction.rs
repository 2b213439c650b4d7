//! Human-in-the-loop tool interception.
//!
//! `AskUserQuestion` and `ExitPlanMode` calls are parked in the
//! [`InteractionRegistry`] as a oneshot responder keyed by session id. The
//! gate awaits the receiver; an API call resolves it. The first resolution
//! wins, later ones find nothing pending. Cancelling drops the responder, which
//! rejects the parked call instead of leaving it hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agentdock_common::WireEvent;
use agentdock_common::wire::{PendingPlan, PendingQuestion};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::error::WorkerError;
use crate::runtime::{PermissionDecision, ToolGate, ToolRequest};

pub const ASK_USER_QUESTION: &str = "AskUserQuestion";
pub const EXIT_PLAN_MODE: &str = "ExitPlanMode";

pub const PLAN_REJECTED_MESSAGE: &str =
    "The user rejected this plan. Ask what they would like to change before proceeding.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Question,
    Plan,
}

impl InteractionKind {
    pub fn label(self) -> &'static str {
        match self {
            InteractionKind::Question => "question",
            InteractionKind::Plan => "plan approval",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub kind: InteractionKind,
    pub tool_use_id: Option<String>,
    pub input: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
enum Resolution {
    Answers(HashMap<String, String>),
    Plan { approved: bool },
}

struct Pending {
    info: PendingInfo,
    responder: oneshot::Sender<Resolution>,
}

#[derive(Default)]
pub struct InteractionRegistry {
    pending: Mutex<HashMap<String, Pending>>,
}

impl InteractionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        session_id: &str,
        info: PendingInfo,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            // Replacing drops the older responder, which rejects its waiter.
            if pending
                .insert(
                    session_id.to_string(),
                    Pending {
                        info,
                        responder: tx,
                    },
                )
                .is_some()
            {
                tracing::warn!(session_id, "Replaced an unresolved interaction");
            }
        }
        rx
    }

    /// Take the pending entry if it is of `kind`. `Ok(None)` means nothing is pending.
    fn take(&self, session_id: &str, kind: InteractionKind) -> Result<Option<Pending>, WorkerError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow::anyhow!("interaction registry poisoned"))?;
        match pending.get(session_id) {
            None => Ok(None),
            Some(p) if p.info.kind == kind => Ok(pending.remove(session_id)),
            Some(_) => Err(WorkerError::NoPendingInteraction {
                session_id: session_id.to_string(),
                expected: kind.label(),
            }),
        }
    }

    /// Returns `Ok(false)` when no question was pending (already resolved).
    pub fn resolve_question(
        &self,
        session_id: &str,
        answers: HashMap<String, String>,
    ) -> Result<bool, WorkerError> {
        match self.take(session_id, InteractionKind::Question)? {
            Some(p) => Ok(p.responder.send(Resolution::Answers(answers)).is_ok()),
            None => Ok(false),
        }
    }

    pub fn resolve_plan(&self, session_id: &str, approved: bool) -> Result<bool, WorkerError> {
        match self.take(session_id, InteractionKind::Plan)? {
            Some(p) => Ok(p.responder.send(Resolution::Plan { approved }).is_ok()),
            None => Ok(false),
        }
    }

    /// Reject whatever is pending for the session.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .map(|mut p| p.remove(session_id).is_some())
            .unwrap_or(false)
    }

    pub fn pending(&self, session_id: &str) -> Option<PendingInfo> {
        self.pending
            .lock()
            .ok()
            .and_then(|p| p.get(session_id).map(|p| p.info.clone()))
    }
}

/// Per-session [`ToolGate`] that parks the two interactive tools.
pub struct SessionGate {
    session_id: String,
    registry: Arc<InteractionRegistry>,
    notices: mpsc::UnboundedSender<WireEvent>,
}

impl SessionGate {
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<InteractionRegistry>,
        notices: mpsc::UnboundedSender<WireEvent>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            registry,
            notices,
        }
    }

    async fn park(
        &self,
        kind: InteractionKind,
        request: &ToolRequest,
        notice: WireEvent,
    ) -> Result<Resolution, WorkerError> {
        let rx = self.registry.register(
            &self.session_id,
            PendingInfo {
                kind,
                tool_use_id: request.tool_use_id.clone(),
                input: request.input.clone(),
                created_at: Utc::now(),
            },
        );
        let _ = self.notices.send(notice);
        tracing::info!(session_id = %self.session_id, tool = %request.tool_name, "Waiting for user");

        rx.await.map_err(|_| WorkerError::InteractionRejected {
            session_id: self.session_id.clone(),
        })
    }
}

#[async_trait]
impl ToolGate for SessionGate {
    async fn can_use_tool(&self, request: ToolRequest) -> Result<PermissionDecision, WorkerError> {
        match request.tool_name.as_str() {
            ASK_USER_QUESTION => {
                let notice = WireEvent::QuestionPending(PendingQuestion {
                    session_id: self.session_id.clone(),
                    tool_use_id: request.tool_use_id.clone(),
                    questions: request.input.get("questions").cloned().unwrap_or(Value::Null),
                });
                let Resolution::Answers(answers) =
                    self.park(InteractionKind::Question, &request, notice).await?
                else {
                    return Err(anyhow::anyhow!("question resolved with a plan decision").into());
                };

                let mut input = match request.input {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                input
                    .entry("questions")
                    .or_insert_with(|| Value::Array(Vec::new()));
                input.insert("answers".into(), json!(answers));
                Ok(PermissionDecision::Allow {
                    updated_input: Value::Object(input),
                })
            }
            EXIT_PLAN_MODE => {
                let notice = WireEvent::PlanPending(PendingPlan {
                    session_id: self.session_id.clone(),
                    tool_use_id: request.tool_use_id.clone(),
                    plan: request
                        .input
                        .get("plan")
                        .and_then(|p| p.as_str())
                        .map(str::to_string),
                    input: request.input.clone(),
                });
                let Resolution::Plan { approved } =
                    self.park(InteractionKind::Plan, &request, notice).await?
                else {
                    return Err(anyhow::anyhow!("plan resolved with answers").into());
                };
                if approved {
                    Ok(PermissionDecision::Allow {
                        updated_input: request.input,
                    })
                } else {
                    Ok(PermissionDecision::Deny {
                        message: PLAN_REJECTED_MESSAGE.to_string(),
                    })
                }
            }
            _ => Ok(PermissionDecision::Allow {
                updated_input: request.input,
            }),
        }
    }
}
