//! Work-item lifecycle beyond setup: starting a swarm, answering
//! permissions, resetting sessions and tearing a work item down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sw_core::session_registry::{
    MappingKey, RegistryError, SessionKind, SessionMapping, SessionRegistry,
};
use sw_core::worktree::{WorktreeError, WorktreeManager};
use sw_integrations::runtime::{AgentRuntime, PermissionResponse, RuntimeError};
use sw_integrations::tracker::IssueTracker;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("no session for work item {work_item} in {project_id}")]
    NoSession { project_id: String, work_item: u64 },
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Clone)]
pub struct SwarmRequest {
    pub project_id: String,
    pub repo_path: PathBuf,
    pub work_item: u64,
    pub title: String,
    pub epic_id: String,
}

pub struct Lifecycle {
    worktrees: Arc<WorktreeManager>,
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn AgentRuntime>,
    tracker: Arc<dyn IssueTracker>,
    swarm_command: String,
}

impl Lifecycle {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self {
            worktrees,
            registry,
            runtime,
            tracker,
            swarm_command: "swarm".to_string(),
        }
    }

    pub fn with_swarm_command(mut self, command: impl Into<String>) -> Self {
        self.swarm_command = command.into();
        self
    }

    /// Open the orchestrator session for an epic and kick the swarm off.
    ///
    /// A live swarm session for the same epic is returned as is. A swarm
    /// mapped to a different epic is aborted (best effort) before the new
    /// one replaces it.
    pub async fn start_swarm(&self, req: &SwarmRequest) -> Result<SessionMapping> {
        let key = MappingKey::new(req.project_id.clone(), req.work_item, SessionKind::Swarm);
        let record = self.worktrees.create(&req.repo_path, req.work_item, &req.title)?;

        if let Some(existing) = self.registry.get(&key) {
            if existing.epic_id.as_deref() == Some(req.epic_id.as_str()) {
                if self
                    .runtime
                    .is_alive(&record.path, &existing.session_id)
                    .await
                    .unwrap_or(false)
                {
                    info!(session = %existing.session_id, epic = %req.epic_id, "swarm already running");
                    self.registry.touch(&key)?;
                    return Ok(existing);
                }
            } else {
                let dir = existing.worktree_path.as_deref().unwrap_or(&record.path);
                match self.runtime.abort_session(dir, &existing.session_id).await {
                    Ok(_) => info!(
                        session = %existing.session_id,
                        epic = ?existing.epic_id,
                        "aborted swarm for previous epic"
                    ),
                    Err(e) => warn!(
                        session = %existing.session_id,
                        error = %e,
                        "could not abort swarm for previous epic"
                    ),
                }
            }
        }

        let title = format!("Swarm #{} {}", req.work_item, req.epic_id);
        let session_id = self.runtime.create_session(&record.path, &title).await?;
        let mapping = self.registry.save(
            SessionMapping::new(&key, session_id.clone())
                .with_worktree(&record.path)
                .with_epic(req.epic_id.clone()),
        )?;
        self.runtime
            .send_command(&record.path, &session_id, &self.swarm_command, &req.epic_id)
            .await?;

        info!(
            session = %session_id,
            epic = %req.epic_id,
            path = %record.path.display(),
            "swarm started"
        );
        Ok(mapping)
    }

    /// Answer a permission raised by `session_id` or one of its children.
    pub async fn respond_to_permission(
        &self,
        project_id: &str,
        work_item: u64,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<bool> {
        let mapping = [SessionKind::Swarm, SessionKind::Planning, SessionKind::Discussion]
            .into_iter()
            .find_map(|kind| self.registry.get(&MappingKey::new(project_id, work_item, kind)))
            .ok_or_else(|| LifecycleError::NoSession {
                project_id: project_id.to_string(),
                work_item,
            })?;
        let work_dir = mapping.worktree_path.ok_or_else(|| LifecycleError::NoSession {
            project_id: project_id.to_string(),
            work_item,
        })?;

        let accepted = self
            .runtime
            .respond_to_permission(&work_dir, session_id, permission_id, response)
            .await?;
        info!(
            session = session_id,
            permission = permission_id,
            response = response.as_str(),
            accepted,
            "permission answered"
        );
        Ok(accepted)
    }

    /// Abort the mapped session (best effort) and forget the mapping.
    /// Returns whether a mapping existed.
    pub async fn reset_session(&self, key: &MappingKey) -> Result<bool> {
        let Some(mapping) = self.registry.get(key) else {
            return Ok(false);
        };
        match mapping.worktree_path.as_deref() {
            Some(dir) if dir.exists() => {
                match self.runtime.abort_session(dir, &mapping.session_id).await {
                    Ok(_) => debug!(session = %mapping.session_id, "session aborted"),
                    Err(e) => warn!(session = %mapping.session_id, error = %e, "could not abort session"),
                }
            }
            _ => debug!(session = %mapping.session_id, "no working directory; skipping abort"),
        }
        let removed = self.registry.remove(key)?;
        info!(
            project = %key.project_id,
            work_item = key.work_item,
            kind = %key.kind,
            "session reset"
        );
        Ok(removed)
    }

    /// Reset planning and swarm sessions, delete the worktree and drop the
    /// workflow label.
    pub async fn teardown(&self, project_id: &str, repo_path: &Path, work_item: u64) -> Result<()> {
        for kind in [SessionKind::Planning, SessionKind::Swarm] {
            self.reset_session(&MappingKey::new(project_id, work_item, kind))
                .await?;
        }
        self.worktrees.delete(repo_path, work_item)?;
        if let Err(e) = self.tracker.remove_label(repo_path, work_item).await {
            warn!(work_item, code = e.code(), error = %e, "could not remove workflow label");
        }
        info!(project = project_id, work_item, "work item torn down");
        Ok(())
    }
}
