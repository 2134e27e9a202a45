//! Setup pipeline: worktree, dependencies, session, seed prompt.
//!
//! Steps run strictly in order and each one is skipped when its
//! postcondition already holds, so re-running a pipeline resumes it.
//! Nothing is returned as an error: every failure becomes a terminal
//! [`SetupEvent::Error`] on the caller's sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sw_core::session_registry::{MappingKey, SessionKind, SessionMapping, SessionRegistry};
use sw_core::worktree::{WorktreeManager, WorktreeRecord};
use sw_integrations::process::{run_cli, CliError};
use sw_integrations::runtime::AgentRuntime;
use sw_integrations::tracker::IssueTracker;
use tracing::{error, info, warn};

use crate::events::{SetupEvent, SetupStep, StepStatus};

// ---------------------------------------------------------------------------
// Dependency installation
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DepsInstaller: Send + Sync {
    async fn install(&self, work_dir: &Path) -> Result<(), CliError>;
}

/// Runs a configured command line (e.g. `npm install`) in the worktree.
pub struct ShellInstaller {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ShellInstaller {
    /// `command` is split on whitespace; an empty command installs nothing.
    pub fn new(command: &str, timeout: Duration) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            timeout,
        }
    }
}

#[async_trait]
impl DepsInstaller for ShellInstaller {
    async fn install(&self, work_dir: &Path) -> Result<(), CliError> {
        if self.program.is_empty() {
            return Ok(());
        }
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        run_cli(&self.program, &args, work_dir, self.timeout).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub project_id: String,
    pub repo_path: PathBuf,
    pub work_item: u64,
    pub title: String,
    pub kind: SessionKind,
}

impl SetupRequest {
    pub fn planning(
        project_id: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        work_item: u64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            repo_path: repo_path.into(),
            work_item,
            title: title.into(),
            kind: SessionKind::Planning,
        }
    }

    fn key(&self) -> MappingKey {
        MappingKey::new(self.project_id.clone(), self.work_item, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupComplete {
    pub session_id: String,
    pub worktree_path: PathBuf,
}

pub struct SetupPipeline {
    worktrees: Arc<WorktreeManager>,
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn AgentRuntime>,
    tracker: Arc<dyn IssueTracker>,
    installer: Arc<dyn DepsInstaller>,
    seed_command: String,
}

/// A step's failure: the step that failed and a human-readable message.
struct StepError {
    step: SetupStep,
    message: String,
}

impl StepError {
    fn new(step: SetupStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl SetupPipeline {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        tracker: Arc<dyn IssueTracker>,
        installer: Arc<dyn DepsInstaller>,
    ) -> Self {
        Self {
            worktrees,
            registry,
            runtime,
            tracker,
            installer,
            seed_command: "plan".to_string(),
        }
    }

    pub fn with_seed_command(mut self, command: impl Into<String>) -> Self {
        self.seed_command = command.into();
        self
    }

    /// Run every step, reporting to `sink`. Returns the resulting session
    /// on success; the terminal event carries the same information.
    pub async fn run(
        &self,
        req: &SetupRequest,
        sink: &flume::Sender<SetupEvent>,
    ) -> Option<SetupComplete> {
        info!(
            project = %req.project_id,
            work_item = req.work_item,
            kind = %req.kind,
            "setup pipeline started"
        );
        match self.run_steps(req, sink).await {
            Ok(done) => {
                info!(
                    work_item = req.work_item,
                    session = %done.session_id,
                    path = %done.worktree_path.display(),
                    "setup pipeline complete"
                );
                send(
                    sink,
                    SetupEvent::Complete {
                        session_id: done.session_id.clone(),
                        worktree_path: done.worktree_path.clone(),
                    },
                );
                Some(done)
            }
            Err(e) => {
                error!(
                    work_item = req.work_item,
                    step = e.step.as_str(),
                    error = %e.message,
                    "setup pipeline failed"
                );
                send(
                    sink,
                    SetupEvent::Step {
                        step: e.step,
                        status: StepStatus::Error,
                        message: Some(e.message.clone()),
                        session_id: None,
                    },
                );
                send(
                    sink,
                    SetupEvent::Error {
                        step: e.step,
                        message: e.message,
                    },
                );
                None
            }
        }
    }

    async fn run_steps(
        &self,
        req: &SetupRequest,
        sink: &flume::Sender<SetupEvent>,
    ) -> Result<SetupComplete, StepError> {
        // create_worktree
        let worktree = if req.kind.requires_worktree() {
            let (record, status) = self.ensure_worktree(req, sink)?;
            finish(sink, SetupStep::CreateWorktree, status, None);
            Some(record)
        } else {
            finish(sink, SetupStep::CreateWorktree, StepStatus::Skipped, None);
            None
        };
        let work_dir = worktree
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_else(|| req.repo_path.clone());

        // install_deps
        match &worktree {
            Some(record) if !record.deps_installed => {
                started(sink, SetupStep::InstallDeps, req.work_item);
                self.installer.install(&work_dir).await.map_err(|e| {
                    let detail = e.detail().unwrap_or_default();
                    let message = if detail.is_empty() {
                        e.to_string()
                    } else {
                        format!("{e}\n{detail}")
                    };
                    StepError::new(SetupStep::InstallDeps, message)
                })?;
                self.worktrees
                    .mark_deps_installed(&req.repo_path, req.work_item)
                    .map_err(|e| StepError::new(SetupStep::InstallDeps, e.to_string()))?;
                finish(sink, SetupStep::InstallDeps, StepStatus::Completed, None);
            }
            _ => finish(sink, SetupStep::InstallDeps, StepStatus::Skipped, None),
        }

        // create_session
        let (session_id, reused) = self
            .ensure_session(req, &work_dir, worktree.as_ref(), sink)
            .await?;
        let status = if reused {
            StepStatus::Skipped
        } else {
            StepStatus::Completed
        };
        finish(sink, SetupStep::CreateSession, status, Some(session_id.clone()));

        // send_prompt
        if reused || req.kind == SessionKind::Discussion {
            finish(sink, SetupStep::SendPrompt, StepStatus::Skipped, None);
        } else {
            started(sink, SetupStep::SendPrompt, req.work_item);
            let args = format!("#{} {}", req.work_item, req.title);
            self.runtime
                .send_command(&work_dir, &session_id, &self.seed_command, &args)
                .await
                .map_err(|e| StepError::new(SetupStep::SendPrompt, e.to_string()))?;
            finish(sink, SetupStep::SendPrompt, StepStatus::Completed, None);
        }

        Ok(SetupComplete {
            session_id,
            worktree_path: work_dir,
        })
    }

    fn ensure_worktree(
        &self,
        req: &SetupRequest,
        sink: &flume::Sender<SetupEvent>,
    ) -> Result<(WorktreeRecord, StepStatus), StepError> {
        let step_err = |e: sw_core::worktree::WorktreeError| {
            StepError::new(SetupStep::CreateWorktree, format!("{e} ({})", e.code()))
        };
        if let Some(record) = self
            .worktrees
            .get(&req.repo_path, req.work_item)
            .map_err(step_err)?
        {
            return Ok((record, StepStatus::Skipped));
        }
        started(sink, SetupStep::CreateWorktree, req.work_item);
        let record = self
            .worktrees
            .create(&req.repo_path, req.work_item, &req.title)
            .map_err(step_err)?;
        Ok((record, StepStatus::Completed))
    }

    /// Returns the session id and whether an existing live session was reused.
    async fn ensure_session(
        &self,
        req: &SetupRequest,
        work_dir: &Path,
        worktree: Option<&WorktreeRecord>,
        sink: &flume::Sender<SetupEvent>,
    ) -> Result<(String, bool), StepError> {
        let key = req.key();

        if let Some(existing) = self.registry.get(&key) {
            match self.runtime.is_alive(work_dir, &existing.session_id).await {
                Ok(true) => {
                    if let Err(e) = self.registry.touch(&key) {
                        warn!(error = %e, "could not refresh session mapping");
                    }
                    info!(session = %existing.session_id, "reusing live session");
                    return Ok((existing.session_id, true));
                }
                Ok(false) => info!(session = %existing.session_id, "mapped session is gone; replacing"),
                Err(e) => warn!(session = %existing.session_id, error = %e, "liveness check failed; replacing session"),
            }
        }

        started(sink, SetupStep::CreateSession, req.work_item);
        let title = format!("#{} {}", req.work_item, req.title);
        let session_id = self
            .runtime
            .create_session(work_dir, &title)
            .await
            .map_err(|e| StepError::new(SetupStep::CreateSession, e.to_string()))?;

        self.registry
            .save(SessionMapping::new(&key, session_id.clone()).with_worktree(work_dir))
            .map_err(|e| StepError::new(SetupStep::CreateSession, e.to_string()))?;

        if req.kind == SessionKind::Planning {
            if let Err(e) = self.tracker.add_label(&req.repo_path, req.work_item).await {
                warn!(work_item = req.work_item, code = e.code(), error = %e, "could not add workflow label");
            }
        }

        let context = system_context(req, work_dir, worktree);
        if let Err(e) = self
            .runtime
            .inject_system_context(work_dir, &session_id, &context)
            .await
        {
            warn!(session = %session_id, error = %e, "could not inject system context");
        }

        Ok((session_id, false))
    }
}

fn system_context(req: &SetupRequest, work_dir: &Path, worktree: Option<&WorktreeRecord>) -> String {
    let mut text = format!(
        "You are working on issue #{} \"{}\".\nWorking directory: {}\n",
        req.work_item,
        req.title,
        work_dir.display()
    );
    if let Some(record) = worktree {
        text.push_str(&format!("Branch: {}\n", record.branch));
        text.push_str(
            "This directory is a dedicated git worktree. Stay inside it: do not read or \
             modify files outside this directory, do not switch branches, and commit only \
             to the branch above.\n",
        );
    }
    text
}

fn send(sink: &flume::Sender<SetupEvent>, event: SetupEvent) {
    if sink.send(event).is_err() {
        warn!("setup event sink closed");
    }
}

/// Reported only for steps that actually do work.
fn started(sink: &flume::Sender<SetupEvent>, step: SetupStep, work_item: u64) {
    info!(step = step.as_str(), work_item, "setup step in progress");
    finish(sink, step, StepStatus::InProgress, None);
}

fn finish(
    sink: &flume::Sender<SetupEvent>,
    step: SetupStep,
    status: StepStatus,
    session_id: Option<String>,
) {
    send(
        sink,
        SetupEvent::Step {
            step,
            status,
            message: None,
            session_id,
        },
    );
}
