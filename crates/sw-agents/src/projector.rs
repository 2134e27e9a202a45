//! Projection of the raw runtime feed into swarm state.
//!
//! [`SwarmProjector`] is synchronous and owns all per-connection state: the
//! agent roster, the pending-permission set and the last emitted progress.
//! The watch loop feeds it one input at a time and forwards whatever events
//! it returns.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sw_integrations::raw_event::{MessagePart, PermissionInfo, RawEvent, RuntimeStatus};
use sw_integrations::runtime::ChildSession;
use tracing::debug;

use crate::events::{AgentState, AgentStatus, PermissionRequest, WatchEvent};
use crate::progress::ProgressSnapshot;

const ACTIVITY_MAX_CHARS: usize = 80;

pub struct SwarmProjector {
    orchestrator_id: String,
    epic_id: Option<String>,
    orchestrator_status: AgentStatus,
    agents: BTreeMap<String, AgentState>,
    pending: BTreeMap<String, PermissionRequest>,
    last_progress: Option<(u32, u32)>,
    completed: bool,
}

impl SwarmProjector {
    pub fn new(orchestrator_id: impl Into<String>, epic_id: Option<String>) -> Self {
        Self {
            orchestrator_id: orchestrator_id.into(),
            epic_id,
            orchestrator_status: AgentStatus::Idle,
            agents: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_progress: None,
            completed: false,
        }
    }

    pub fn orchestrator_id(&self) -> &str {
        &self.orchestrator_id
    }

    pub fn epic_id(&self) -> Option<&str> {
        self.epic_id.as_deref()
    }

    pub fn orchestrator_status(&self) -> AgentStatus {
        self.orchestrator_status
    }

    pub fn agent(&self, session_id: &str) -> Option<&AgentState> {
        self.agents.get(session_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values()
    }

    pub fn pending_permissions(&self) -> impl Iterator<Item = &PermissionRequest> {
        self.pending.values()
    }

    pub fn is_pending(&self, permission_id: &str) -> bool {
        self.pending.contains_key(permission_id)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Add child sessions that existed before the feed was subscribed.
    pub fn seed(&mut self, children: Vec<ChildSession>) {
        for child in children {
            self.agents
                .entry(child.id.clone())
                .or_insert_with(|| AgentState::idle(child.id, child.title));
        }
    }

    /// Add permissions that were already waiting when the watch started.
    pub fn seed_permissions(&mut self, permissions: Vec<PermissionInfo>) {
        for p in permissions.into_iter().filter(PermissionInfo::is_pending) {
            self.request_permission(p);
        }
    }

    pub fn connected_event(&self) -> WatchEvent {
        WatchEvent::Connected {
            orchestrator_id: self.orchestrator_id.clone(),
            epic_id: self.epic_id.clone(),
            agent_count: self.agents.len(),
            agents: self.agents.values().cloned().collect(),
        }
    }

    pub fn apply(&mut self, event: RawEvent) -> Vec<WatchEvent> {
        match event {
            RawEvent::SessionCreated(info) => {
                if info.parent_id.as_deref() != Some(self.orchestrator_id.as_str())
                    || self.agents.contains_key(&info.id)
                {
                    return Vec::new();
                }
                let agent = AgentState::idle(info.id.clone(), info.title);
                self.agents.insert(info.id, agent.clone());
                vec![WatchEvent::AgentCreated { agent }]
            }
            RawEvent::SessionUpdated(info) => {
                if let Some(agent) = self.agents.get_mut(&info.id) {
                    if !info.title.is_empty() {
                        agent.title = info.title;
                    }
                }
                Vec::new()
            }
            RawEvent::SessionStatus { session_id, status } => {
                self.apply_status(&session_id, status)
            }
            RawEvent::PermissionUpdated(p) => {
                if !self.agents.contains_key(&p.session_id) {
                    return Vec::new();
                }
                if p.is_pending() {
                    self.request_permission(p)
                } else {
                    self.resolve_permission(&p.id, p.status)
                }
            }
            RawEvent::PermissionReplied {
                permission_id,
                response,
                ..
            } => self.resolve_permission(&permission_id, response),
            RawEvent::MessagePartUpdated(part) => self.apply_part(part),
            RawEvent::Unknown(kind) => {
                if !kind.is_empty() {
                    debug!(kind = %kind, "ignoring raw event");
                }
                Vec::new()
            }
        }
    }

    /// Emit `progress.updated` when the (completed, total) pair moved, and
    /// `swarm.completed` the first time the percentage reaches 100.
    pub fn apply_progress(&mut self, snapshot: ProgressSnapshot) -> Vec<WatchEvent> {
        let key = snapshot.dedup_key();
        if self.last_progress == Some(key) {
            return Vec::new();
        }
        self.last_progress = Some(key);

        let mut out = vec![WatchEvent::ProgressUpdated { progress: snapshot }];
        if snapshot.is_finished() && !self.completed {
            self.completed = true;
            out.push(WatchEvent::SwarmCompleted {
                epic_id: self.epic_id.clone(),
                progress: snapshot,
            });
        }
        out
    }

    fn apply_status(&mut self, session_id: &str, status: RuntimeStatus) -> Vec<WatchEvent> {
        let mapped = match &status {
            RuntimeStatus::Busy => AgentStatus::Busy,
            RuntimeStatus::Idle => AgentStatus::Idle,
            RuntimeStatus::Retry { .. } => AgentStatus::Error,
            RuntimeStatus::Other(s) => {
                debug!(session = session_id, status = %s, "unmapped runtime status");
                return Vec::new();
            }
        };

        if session_id == self.orchestrator_id {
            self.orchestrator_status = mapped;
            let mut out = vec![WatchEvent::OrchestratorStatus { status: mapped }];
            if let RuntimeStatus::Retry { attempt, message } = status {
                let detail = message.unwrap_or_else(|| "runtime is retrying".to_string());
                let message = match attempt {
                    Some(n) => format!("orchestrator retrying (attempt {n}): {detail}"),
                    None => format!("orchestrator retrying: {detail}"),
                };
                out.push(WatchEvent::SwarmError {
                    message,
                    fatal: false,
                });
            }
            return out;
        }

        let Some(agent) = self.agents.get_mut(session_id) else {
            return Vec::new();
        };
        // A blocked agent stays blocked until its permission is resolved.
        if agent.pending_permission.is_some() || agent.status == mapped {
            return Vec::new();
        }
        agent.status = mapped;
        vec![WatchEvent::AgentStatus {
            session_id: session_id.to_string(),
            status: mapped,
        }]
    }

    fn request_permission(&mut self, p: PermissionInfo) -> Vec<WatchEvent> {
        let Some(agent) = self.agents.get_mut(&p.session_id) else {
            return Vec::new();
        };
        if self.pending.contains_key(&p.id) {
            return Vec::new();
        }

        let request = PermissionRequest {
            id: p.id.clone(),
            session_id: p.session_id.clone(),
            kind: p.kind,
            pattern: p.pattern,
            title: p.title,
            metadata: p.metadata,
            requested_at: p.requested_at.unwrap_or_else(Utc::now),
        };
        self.pending.insert(p.id.clone(), request.clone());

        let was_blocked = agent.status == AgentStatus::Blocked;
        agent.pending_permission = Some(p.id);
        agent.status = AgentStatus::Blocked;

        let mut out = vec![WatchEvent::PermissionRequested {
            permission: request,
        }];
        if !was_blocked {
            out.push(WatchEvent::AgentStatus {
                session_id: p.session_id,
                status: AgentStatus::Blocked,
            });
        }
        out
    }

    fn resolve_permission(
        &mut self,
        permission_id: &str,
        response: Option<String>,
    ) -> Vec<WatchEvent> {
        let Some(request) = self.pending.remove(permission_id) else {
            return Vec::new();
        };
        let mut out = vec![WatchEvent::PermissionResolved {
            permission_id: request.id.clone(),
            session_id: request.session_id.clone(),
            response,
        }];

        let next = self
            .pending
            .values()
            .find(|r| r.session_id == request.session_id)
            .map(|r| r.id.clone());

        if let Some(agent) = self.agents.get_mut(&request.session_id) {
            match next {
                Some(other) => agent.pending_permission = Some(other),
                None => {
                    agent.pending_permission = None;
                    agent.status = AgentStatus::Busy;
                    out.push(WatchEvent::AgentStatus {
                        session_id: request.session_id,
                        status: AgentStatus::Busy,
                    });
                }
            }
        }
        out
    }

    fn apply_part(&mut self, part: MessagePart) -> Vec<WatchEvent> {
        if part.kind != "tool" {
            return Vec::new();
        }
        let Some(state) = part.state else {
            return Vec::new();
        };
        if state.status != "running" {
            return Vec::new();
        }
        let Some(agent) = self.agents.get_mut(&part.session_id) else {
            return Vec::new();
        };

        let tool = part.tool.unwrap_or_else(|| "tool".to_string());
        let description = describe_tool(&tool, &state.input, state.title.as_deref());
        if agent.last_activity.as_deref() == Some(description.as_str()) {
            return Vec::new();
        }

        let at = Utc::now();
        agent.last_activity = Some(description.clone());
        agent.last_activity_at = Some(at);
        vec![WatchEvent::AgentActivity {
            session_id: part.session_id,
            tool,
            description,
            at,
        }]
    }
}

/// One-line description of a running tool call.
pub fn describe_tool(tool: &str, input: &Value, title: Option<&str>) -> String {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| input.get(*n).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty())
    };

    let primary = match tool {
        "bash" => field(&["command"]),
        "read" | "write" | "edit" => field(&["filePath", "file_path", "path"]),
        "grep" | "glob" => field(&["pattern"]),
        "webfetch" => field(&["url"]),
        "task" => field(&["description", "prompt"]),
        _ => None,
    };

    let text = match (primary, title.filter(|t| !t.trim().is_empty())) {
        (Some(arg), _) => format!("{tool}: {}", arg.lines().next().unwrap_or(arg).trim()),
        (None, Some(t)) => t.trim().to_string(),
        (None, None) => tool.to_string(),
    };
    truncate(&text, ACTIVITY_MAX_CHARS)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
