//! Seam between orchestration and the agent runtime.
//!
//! Orchestration code depends on [`AgentRuntime`] only; the OpenCode HTTP
//! client is one implementation and tests supply in-memory ones.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::raw_event::{PermissionInfo, RawEvent};

/// A boxed, owned stream of raw runtime events.
pub type EventStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// How to answer a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

impl PermissionResponse {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionResponse::Once => "once",
            PermissionResponse::Always => "always",
            PermissionResponse::Reject => "reject",
        }
    }
}

impl std::str::FromStr for PermissionResponse {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "always" => Ok(Self::Always),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown permission response: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime request failed: {0}")]
    Transport(String),
    #[error("runtime returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("runtime response could not be decoded: {0}")]
    Decode(String),
    #[error("operation not supported by runtime: {0}")]
    Unsupported(&'static str),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "runtime_transport",
            Self::Status { .. } => "runtime_status",
            Self::Decode(_) => "runtime_decode",
            Self::Unsupported(_) => "runtime_unsupported",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Operations the orchestrator needs from the agent runtime.
///
/// Every call is scoped to a working directory: the runtime serves one
/// workspace per directory.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(&self, work_dir: &Path, title: &str) -> Result<String>;

    async fn is_alive(&self, work_dir: &Path, session_id: &str) -> Result<bool>;

    /// Add context to a session without triggering a reply.
    async fn inject_system_context(&self, work_dir: &Path, session_id: &str, text: &str)
        -> Result<()>;

    async fn send_command(
        &self,
        work_dir: &Path,
        session_id: &str,
        command: &str,
        args: &str,
    ) -> Result<()>;

    async fn get_child_sessions(&self, work_dir: &Path, parent_id: &str)
        -> Result<Vec<ChildSession>>;

    async fn subscribe_events(&self, work_dir: &Path) -> Result<EventStream>;

    async fn respond_to_permission(
        &self,
        work_dir: &Path,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<bool>;

    async fn abort_session(&self, work_dir: &Path, session_id: &str) -> Result<bool>;

    /// Permissions currently awaiting an answer. Runtimes without a listing
    /// endpoint return [`RuntimeError::Unsupported`].
    async fn list_pending_permissions(&self, _work_dir: &Path) -> Result<Vec<PermissionInfo>> {
        Err(RuntimeError::Unsupported("list_pending_permissions"))
    }
}
