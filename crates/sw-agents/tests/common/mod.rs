//! In-memory collaborators shared by the sw-agents integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sw_agents::pipeline::DepsInstaller;
use sw_core::session_registry::SessionRegistry;
use sw_core::worktree::{GitOutput, GitRunner, WorktreeManager};
use sw_integrations::process::CliError;
use sw_integrations::raw_event::{PermissionInfo, RawEvent};
use sw_integrations::runtime::{
    AgentRuntime, ChildSession, EventStream, PermissionResponse, Result as RuntimeResult,
    RuntimeError,
};
use sw_integrations::tasks::{TaskRecord, TaskStore, TaskStoreError};
use sw_integrations::tracker::{IssueTracker, TrackerError};

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Git stand-in: every repository has a local `main`, no remote, and
/// `worktree add` materialises the target directory.
#[derive(Default)]
pub struct FakeGit {
    pub commands: Mutex<Vec<String>>,
}

impl GitRunner for FakeGit {
    fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        self.commands.lock().unwrap().push(args.join(" "));
        let ok = |stdout: &str| {
            Ok(GitOutput {
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        };
        let fail = || {
            Ok(GitOutput {
                success: false,
                ..GitOutput::default()
            })
        };

        match args {
            ["remote", ..] | ["symbolic-ref", ..] => fail(),
            ["rev-parse", "--verify", "--quiet", reference] => {
                if *reference == "refs/heads/main" {
                    ok("")
                } else {
                    fail()
                }
            }
            ["rev-parse", "--is-inside-work-tree"] => ok("true\n"),
            ["worktree", "add", rest @ ..] => {
                let path = match rest {
                    ["-b", _branch, path, _base] => path,
                    [path, _branch] => path,
                    _ => return fail(),
                };
                std::fs::create_dir_all(path).map_err(|e| e.to_string())?;
                std::fs::write(Path::new(path).join(".git"), "gitdir: fake\n")
                    .map_err(|e| e.to_string())?;
                ok("")
            }
            _ => ok(""),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Create { dir: PathBuf, title: String },
    Inject { session: String, text: String },
    Command { session: String, command: String, args: String },
    Respond { session: String, permission: String, response: PermissionResponse },
    Abort { session: String },
}

#[derive(Default)]
pub struct MockRuntime {
    pub calls: Mutex<Vec<RuntimeCall>>,
    pub alive: Mutex<HashSet<String>>,
    pub children: Mutex<Vec<ChildSession>>,
    pub pending_permissions: Mutex<Option<Vec<PermissionInfo>>>,
    pub feed: Mutex<Option<flume::Receiver<RawEvent>>>,
    pub fail_create: Mutex<bool>,
    next_id: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a raw feed and return the sender that drives it.
    pub fn with_feed(&self) -> flume::Sender<RawEvent> {
        let (tx, rx) = flume::unbounded();
        *self.feed.lock().unwrap() = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn create_session(&self, work_dir: &Path, title: &str) -> RuntimeResult<String> {
        if *self.fail_create.lock().unwrap() {
            return Err(RuntimeError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        let id = format!("ses_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(RuntimeCall::Create {
            dir: work_dir.to_path_buf(),
            title: title.to_string(),
        });
        self.alive.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn is_alive(&self, _work_dir: &Path, session_id: &str) -> RuntimeResult<bool> {
        Ok(self.alive.lock().unwrap().contains(session_id))
    }

    async fn inject_system_context(
        &self,
        _work_dir: &Path,
        session_id: &str,
        text: &str,
    ) -> RuntimeResult<()> {
        self.record(RuntimeCall::Inject {
            session: session_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_command(
        &self,
        _work_dir: &Path,
        session_id: &str,
        command: &str,
        args: &str,
    ) -> RuntimeResult<()> {
        self.record(RuntimeCall::Command {
            session: session_id.to_string(),
            command: command.to_string(),
            args: args.to_string(),
        });
        Ok(())
    }

    async fn get_child_sessions(
        &self,
        _work_dir: &Path,
        _parent_id: &str,
    ) -> RuntimeResult<Vec<ChildSession>> {
        Ok(self.children.lock().unwrap().clone())
    }

    async fn subscribe_events(&self, _work_dir: &Path) -> RuntimeResult<EventStream> {
        match self.feed.lock().unwrap().take() {
            Some(rx) => Ok(rx.into_stream().boxed()),
            None => Ok(futures_util::stream::pending().boxed()),
        }
    }

    async fn respond_to_permission(
        &self,
        _work_dir: &Path,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> RuntimeResult<bool> {
        self.record(RuntimeCall::Respond {
            session: session_id.to_string(),
            permission: permission_id.to_string(),
            response,
        });
        Ok(true)
    }

    async fn abort_session(&self, _work_dir: &Path, session_id: &str) -> RuntimeResult<bool> {
        self.record(RuntimeCall::Abort {
            session: session_id.to_string(),
        });
        Ok(self.alive.lock().unwrap().remove(session_id))
    }

    async fn list_pending_permissions(
        &self,
        _work_dir: &Path,
    ) -> RuntimeResult<Vec<PermissionInfo>> {
        match self.pending_permissions.lock().unwrap().clone() {
            Some(list) => Ok(list),
            None => Err(RuntimeError::Unsupported("list_pending_permissions")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker, installer, task store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockTracker {
    pub added: Mutex<Vec<u64>>,
    pub removed: Mutex<Vec<u64>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn add_label(&self, _repo_path: &Path, issue: u64) -> Result<(), TrackerError> {
        if *self.fail.lock().unwrap() {
            return Err(TrackerError::Cli(CliError::Failed {
                program: "gh".into(),
                status: "exit status: 1".into(),
                stdout: String::new(),
                stderr: "HTTP 401: Bad credentials".into(),
            }));
        }
        self.added.lock().unwrap().push(issue);
        Ok(())
    }

    async fn remove_label(&self, _repo_path: &Path, issue: u64) -> Result<(), TrackerError> {
        self.removed.lock().unwrap().push(issue);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockInstaller {
    pub runs: AtomicUsize,
    pub fail: Mutex<bool>,
}

impl MockInstaller {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DepsInstaller for MockInstaller {
    async fn install(&self, _work_dir: &Path) -> Result<(), CliError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(CliError::Timeout {
                program: "npm".into(),
                secs: 120,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTasks {
    pub tasks: Mutex<Vec<TaskRecord>>,
    pub listings: AtomicUsize,
    /// How long each listing takes.
    pub delay: Mutex<Duration>,
}

impl MockTasks {
    pub fn set(&self, tasks: Vec<TaskRecord>) {
        *self.tasks.lock().unwrap() = tasks;
    }
}

#[async_trait]
impl TaskStore for MockTasks {
    async fn list(&self, _work_dir: &Path) -> Result<Vec<TaskRecord>, TaskStoreError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.tasks.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub repo: PathBuf,
    pub worktrees: Arc<WorktreeManager>,
    pub registry: Arc<SessionRegistry>,
    pub runtime: Arc<MockRuntime>,
    pub tracker: Arc<MockTracker>,
    pub installer: Arc<MockInstaller>,
    pub tasks: Arc<MockTasks>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("acme-web");
        std::fs::create_dir_all(&repo).expect("repo dir");
        let worktrees = WorktreeManager::with_git_runner(
            tmp.path().join("worktrees"),
            tmp.path().join("worktrees.json"),
            Box::new(FakeGit::default()),
        );
        Self {
            registry: Arc::new(SessionRegistry::new(tmp.path().join("sessions.json"))),
            worktrees: Arc::new(worktrees),
            runtime: Arc::new(MockRuntime::new()),
            tracker: Arc::new(MockTracker::default()),
            installer: Arc::new(MockInstaller::default()),
            tasks: Arc::new(MockTasks::default()),
            repo,
            tmp,
        }
    }
}

pub fn task(
    id: &str,
    parent: Option<&str>,
    kind: sw_integrations::tasks::TaskKind,
    status: sw_integrations::tasks::TaskStatus,
) -> TaskRecord {
    TaskRecord {
        id: id.into(),
        title: id.into(),
        kind,
        status,
        priority: None,
        parent_id: parent.map(str::to_string),
        blocks: vec![],
        blocked_by: vec![],
    }
}
