//! Outbound push events.
//!
//! Every event serialises as a JSON object discriminated by `type`.
//! Consumers are expected to ignore kinds they do not recognise.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::ProgressSnapshot;

// ---------------------------------------------------------------------------
// Setup pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    CreateWorktree,
    InstallDeps,
    CreateSession,
    SendPrompt,
}

impl SetupStep {
    pub const ALL: [SetupStep; 4] = [
        SetupStep::CreateWorktree,
        SetupStep::InstallDeps,
        SetupStep::CreateSession,
        SetupStep::SendPrompt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SetupStep::CreateWorktree => "create_worktree",
            SetupStep::InstallDeps => "install_deps",
            SetupStep::CreateSession => "create_session",
            SetupStep::SendPrompt => "send_prompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupEvent {
    #[serde(rename_all = "camelCase")]
    Step {
        step: SetupStep,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Set once `create_session` has produced or reused a session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        session_id: String,
        worktree_path: PathBuf,
    },
    Error {
        step: SetupStep,
        message: String,
    },
}

impl SetupEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SetupEvent::Step { .. } => "step",
            SetupEvent::Complete { .. } => "complete",
            SetupEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SetupEvent::Step { .. })
    }
}

// ---------------------------------------------------------------------------
// Swarm watch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Blocked,
    Error,
    Completed,
}

/// Projected view of one child session.
///
/// `pending_permission` is set exactly when `status` is [`AgentStatus::Blocked`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub session_id: String,
    pub title: String,
    pub status: AgentStatus,
    pub last_activity: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub pending_permission: Option<String>,
}

impl AgentState {
    pub fn idle(session_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            title: title.into(),
            status: AgentStatus::Idle,
            last_activity: None,
            last_activity_at: None,
            pending_permission: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: Option<String>,
    pub title: String,
    pub metadata: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WatchEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        orchestrator_id: String,
        epic_id: Option<String>,
        agent_count: usize,
        agents: Vec<AgentState>,
    },
    #[serde(rename = "agent.created")]
    AgentCreated { agent: AgentState },
    #[serde(rename = "agent.status", rename_all = "camelCase")]
    AgentStatus {
        session_id: String,
        status: AgentStatus,
    },
    #[serde(rename = "agent.activity", rename_all = "camelCase")]
    AgentActivity {
        session_id: String,
        tool: String,
        description: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "permission.requested")]
    PermissionRequested { permission: PermissionRequest },
    #[serde(rename = "permission.resolved", rename_all = "camelCase")]
    PermissionResolved {
        permission_id: String,
        session_id: String,
        response: Option<String>,
    },
    #[serde(rename = "orchestrator.status")]
    OrchestratorStatus { status: AgentStatus },
    #[serde(rename = "progress.updated")]
    ProgressUpdated { progress: ProgressSnapshot },
    #[serde(rename = "swarm.completed", rename_all = "camelCase")]
    SwarmCompleted {
        epic_id: Option<String>,
        progress: ProgressSnapshot,
    },
    /// `fatal: false` is advisory; the watch keeps running.
    #[serde(rename = "swarm.error")]
    SwarmError { message: String, fatal: bool },
    #[serde(rename = "heartbeat")]
    Heartbeat { at: DateTime<Utc> },
}

impl WatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Connected { .. } => "connected",
            WatchEvent::AgentCreated { .. } => "agent.created",
            WatchEvent::AgentStatus { .. } => "agent.status",
            WatchEvent::AgentActivity { .. } => "agent.activity",
            WatchEvent::PermissionRequested { .. } => "permission.requested",
            WatchEvent::PermissionResolved { .. } => "permission.resolved",
            WatchEvent::OrchestratorStatus { .. } => "orchestrator.status",
            WatchEvent::ProgressUpdated { .. } => "progress.updated",
            WatchEvent::SwarmCompleted { .. } => "swarm.completed",
            WatchEvent::SwarmError { .. } => "swarm.error",
            WatchEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}
