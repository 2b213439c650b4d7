//! Orchestrator-side session registry.
//!
//! Maps session ids to the issue and compute unit that own them, and issue
//! ids to their live sessions. All mutation goes through the methods below so
//! the two maps never disagree.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Streaming,
    Idle,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSession {
    pub session_id: String,
    pub issue_id: String,
    pub project_id: String,
    pub compute_unit_id: String,
    /// Endpoint of the owning unit at registration time.
    pub endpoint_url: String,
    pub conversation_id: Option<String>,
    pub status: SessionStatus,
}

#[derive(Debug, Default)]
pub struct SessionRouter {
    sessions: DashMap<String, OrchestratorSession>,
    by_issue: DashMap<String, BTreeSet<String>>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: OrchestratorSession) {
        self.by_issue
            .entry(session.issue_id.clone())
            .or_default()
            .insert(session.session_id.clone());
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn unregister(&self, session_id: &str) -> Option<OrchestratorSession> {
        let (_, session) = self.sessions.remove(session_id)?;
        let now_empty = self
            .by_issue
            .get_mut(&session.issue_id)
            .map(|mut ids| {
                ids.remove(session_id);
                ids.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            self.by_issue.remove_if(&session.issue_id, |_, ids| ids.is_empty());
        }
        Some(session)
    }

    pub fn get(&self, session_id: &str) -> Option<OrchestratorSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn sessions_for_issue(&self, issue_id: &str) -> Vec<OrchestratorSession> {
        let ids: Vec<String> = self
            .by_issue
            .get(issue_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Record the agent conversation id reported by a turn's result.
    pub fn record_result(&self, session_id: &str, conversation_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.conversation_id = Some(conversation_id.to_string());
        }
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.status = status;
        }
    }

    /// Whether any session of the issue is mid-turn.
    pub fn has_streaming(&self, issue_id: &str) -> bool {
        self.sessions_for_issue(issue_id)
            .iter()
            .any(|s| s.status == SessionStatus::Streaming)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
