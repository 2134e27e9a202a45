use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::slug;
use crate::store::{JsonStore, StoreError, Versioned, CURRENT_VERSION};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when managing git worktrees.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    /// The directory given as the repository is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(String),

    /// The deterministic worktree path exists but is not a git worktree.
    ///
    /// Never auto-corrected: the directory may hold unrelated files and the
    /// caller has to resolve it by hand.
    #[error("path occupied by something that is not a git worktree: {0}")]
    PathOccupied(String),

    /// Neither the remote HEAD nor a local `main`/`master` branch exists.
    #[error("could not determine default branch of {0}")]
    NoDefaultBranch(String),

    /// A git command returned a non-zero exit code.
    #[error("git {command} failed: {stderr}")]
    GitCommand {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// The git binary could not be started.
    #[error("failed to run git: {0}")]
    GitSpawn(String),

    #[error("worktree metadata store: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorktreeError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAGitRepo(_) => "not_a_git_repo",
            Self::PathOccupied(_) => "path_occupied",
            Self::NoDefaultBranch(_) => "no_default_branch",
            Self::GitCommand { .. } => "git_failed",
            Self::GitSpawn(_) => "git_spawn",
            Self::Store(_) => "store_failed",
            Self::Io(_) => "io_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory.
    ///
    /// `Err` means git could not be executed at all; a command that ran and
    /// failed is reported through [`GitOutput::success`].
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeRecord
// ---------------------------------------------------------------------------

/// Persisted metadata for one work item's worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub repo_slug: String,
    pub work_item: u64,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deps_installed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorktreeDoc {
    pub version: u32,
    #[serde(default)]
    pub worktrees: BTreeMap<String, WorktreeRecord>,
}

impl Default for WorktreeDoc {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            worktrees: BTreeMap::new(),
        }
    }
}

impl Versioned for WorktreeDoc {
    fn version(&self) -> u32 {
        self.version
    }
}

fn record_key(repo_slug: &str, work_item: u64) -> String {
    format!("{repo_slug}/{work_item}")
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Creates, resumes and tears down one isolated git worktree per work item.
///
/// Worktrees live at `{root}/{repo_slug}/issue-{id}` on branch
/// `feature/issue-{id}-{title-slug}`. Metadata is kept in a central JSON
/// store outside the worktree, so it survives worktree deletion and is never
/// committed. Records whose directory stopped being a valid worktree are
/// dropped the next time they are read.
pub struct WorktreeManager {
    root: PathBuf,
    store: JsonStore<WorktreeDoc>,
    git: Box<dyn GitRunner>,
    slug_max_len: usize,
}

impl WorktreeManager {
    /// Create a manager with the real git runner.
    pub fn new(root: impl Into<PathBuf>, store_path: impl Into<PathBuf>) -> Self {
        Self::with_git_runner(root, store_path, Box::new(RealGitRunner))
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        root: impl Into<PathBuf>,
        store_path: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            store: JsonStore::new(store_path),
            git,
            slug_max_len: 50,
        }
    }

    /// Cap the title part of generated branch names.
    pub fn with_slug_max_len(mut self, max_len: usize) -> Self {
        self.slug_max_len = max_len.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create or resume the worktree for a work item.
    ///
    /// Resolution order:
    /// 1. a valid worktree already at the deterministic path is returned as-is
    ///    (whatever branch it is on);
    /// 2. an existing branch without a worktree gets a fresh worktree attached;
    /// 3. otherwise a new branch is cut from the default branch.
    pub fn create(&self, repo_path: &Path, work_item: u64, title: &str) -> Result<WorktreeRecord> {
        self.ensure_repo(repo_path)?;

        let repo_slug = self.repo_slug(repo_path);
        let path = self.worktree_path(&repo_slug, work_item);
        let branch = slug::branch_name(work_item, title, self.slug_max_len);
        let key = record_key(&repo_slug, work_item);

        if path.exists() {
            if !self.is_valid_worktree(&path) {
                warn!(path = %path.display(), "worktree path occupied by foreign content");
                return Err(WorktreeError::PathOccupied(path.display().to_string()));
            }

            if let Some(existing) = self.store.load().worktrees.get(&key).cloned() {
                info!(work_item, path = %existing.path.display(), "resuming existing worktree");
                return Ok(existing);
            }

            // Valid worktree with no metadata: adopt it as-is.
            let current = self.current_branch(&path).unwrap_or(branch);
            let record = WorktreeRecord {
                repo_slug,
                work_item,
                path,
                branch: current,
                created_at: Utc::now(),
                deps_installed: false,
            };
            info!(work_item, path = %record.path.display(), branch = %record.branch, "adopting untracked worktree");
            self.store
                .update(|doc| doc.worktrees.insert(key, record.clone()))?;
            return Ok(record);
        }

        // Drop registrations for worktree directories that vanished.
        match self.git.run_git(repo_path, &["worktree", "prune"]) {
            Ok(out) if out.success => {}
            Ok(out) => debug!(stderr = %out.stderr.trim(), "git worktree prune failed"),
            Err(e) => debug!(error = %e, "could not run git worktree prune"),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().into_owned();

        if self.branch_exists(repo_path, &branch) {
            info!(work_item, branch = %branch, "attaching worktree to existing branch");
            self.git_ok(repo_path, &["worktree", "add", &path_str, &branch])?;
        } else {
            let base = self.default_branch(repo_path)?;
            info!(
                work_item,
                worktree = %path.display(),
                branch = %branch,
                base = %base,
                "creating worktree on new branch"
            );
            self.git_ok(repo_path, &["worktree", "add", "-b", &branch, &path_str, &base])?;
        }

        let record = WorktreeRecord {
            repo_slug,
            work_item,
            path,
            branch,
            created_at: Utc::now(),
            deps_installed: false,
        };
        self.store
            .update(|doc| doc.worktrees.insert(key, record.clone()))?;
        Ok(record)
    }

    /// Look up a work item's worktree, dropping metadata that went stale.
    pub fn get(&self, repo_path: &Path, work_item: u64) -> Result<Option<WorktreeRecord>> {
        let key = record_key(&self.repo_slug(repo_path), work_item);
        let Some(record) = self.store.load().worktrees.get(&key).cloned() else {
            return Ok(None);
        };
        self.heal(key, record)
    }

    /// All live worktrees recorded for a repository.
    pub fn list(&self, repo_path: &Path) -> Result<Vec<WorktreeRecord>> {
        let repo_slug = self.repo_slug(repo_path);
        let candidates: Vec<(String, WorktreeRecord)> = self
            .store
            .load()
            .worktrees
            .into_iter()
            .filter(|(_, r)| r.repo_slug == repo_slug)
            .collect();

        let mut live = Vec::with_capacity(candidates.len());
        for (key, record) in candidates {
            if let Some(record) = self.heal(key, record)? {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Tear down a work item's worktree.
    ///
    /// Worktree removal, branch deletion and directory removal are each
    /// attempted independently and their failures only logged; the metadata
    /// record is always deleted. Only a metadata store failure is returned.
    pub fn delete(&self, repo_path: &Path, work_item: u64) -> Result<()> {
        let repo_slug = self.repo_slug(repo_path);
        let key = record_key(&repo_slug, work_item);
        let record = self.store.load().worktrees.get(&key).cloned();

        let path = record
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_else(|| self.worktree_path(&repo_slug, work_item));
        let path_str = path.to_string_lossy().into_owned();
        let branches = match &record {
            Some(r) => vec![r.branch.clone()],
            None => self.branches_for_item(repo_path, work_item),
        };

        info!(work_item, path = %path.display(), "deleting worktree");

        let removed = match self
            .git
            .run_git(repo_path, &["worktree", "remove", "--force", &path_str])
        {
            Ok(out) if out.success => true,
            Ok(out) => {
                debug!(path = %path.display(), stderr = %out.stderr.trim(), "git worktree remove failed");
                false
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not run git worktree remove");
                false
            }
        };

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove worktree directory");
            }
        }

        if !removed {
            match self.git.run_git(repo_path, &["worktree", "prune"]) {
                Ok(out) if out.success => {}
                Ok(out) => warn!(stderr = %out.stderr.trim(), "git worktree prune failed"),
                Err(e) => warn!(error = %e, "could not run git worktree prune"),
            }
        }

        for branch in &branches {
            match self.git.run_git(repo_path, &["branch", "-D", branch]) {
                Ok(out) if out.success => debug!(branch = %branch, "deleted branch"),
                Ok(out) => debug!(branch = %branch, stderr = %out.stderr.trim(), "branch not deleted"),
                Err(e) => warn!(branch = %branch, error = %e, "could not run git branch -D"),
            }
        }

        self.store.update(|doc| {
            doc.worktrees.remove(&key);
        })?;
        Ok(())
    }

    /// Record that dependencies were installed. Returns `false` when no
    /// record exists.
    pub fn mark_deps_installed(&self, repo_path: &Path, work_item: u64) -> Result<bool> {
        let key = record_key(&self.repo_slug(repo_path), work_item);
        if !self.store.load().worktrees.contains_key(&key) {
            return Ok(false);
        }
        let updated = self.store.update(|doc| match doc.worktrees.get_mut(&key) {
            Some(record) => {
                record.deps_installed = true;
                true
            }
            None => false,
        })?;
        Ok(updated)
    }

    /// Slug for a repository: from its `origin` remote, else its directory name.
    pub fn repo_slug(&self, repo_path: &Path) -> String {
        match self
            .git
            .run_git(repo_path, &["remote", "get-url", "origin"])
        {
            Ok(out) if out.success => slug::repo_slug_from_remote(&out.stdout)
                .unwrap_or_else(|| slug::repo_slug_from_dir(repo_path)),
            _ => slug::repo_slug_from_dir(repo_path),
        }
    }

    /// Deterministic worktree location for a repo slug and work item.
    pub fn worktree_path(&self, repo_slug: &str, work_item: u64) -> PathBuf {
        slug::worktree_path(&self.root, repo_slug, work_item)
    }

    /// Whether `path` is a working copy git recognises.
    pub fn is_valid_worktree(&self, path: &Path) -> bool {
        if !path.is_dir() || !path.join(".git").exists() {
            return false;
        }
        matches!(
            self.git.run_git(path, &["rev-parse", "--is-inside-work-tree"]),
            Ok(out) if out.success && out.stdout.trim() == "true"
        )
    }

    // -- internals ---------------------------------------------------------

    fn heal(&self, key: String, record: WorktreeRecord) -> Result<Option<WorktreeRecord>> {
        if self.is_valid_worktree(&record.path) {
            return Ok(Some(record));
        }
        info!(
            work_item = record.work_item,
            path = %record.path.display(),
            "worktree vanished, dropping stale metadata"
        );
        self.store.update(|doc| {
            doc.worktrees.remove(&key);
        })?;
        Ok(None)
    }

    fn ensure_repo(&self, repo_path: &Path) -> Result<()> {
        let not_repo = || WorktreeError::NotAGitRepo(repo_path.display().to_string());
        if !repo_path.is_dir() {
            return Err(not_repo());
        }
        match self.git.run_git(repo_path, &["rev-parse", "--git-dir"]) {
            Ok(out) if out.success => Ok(()),
            Ok(_) => Err(not_repo()),
            Err(e) => Err(WorktreeError::GitSpawn(e)),
        }
    }

    fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let out = self
            .git
            .run_git(dir, args)
            .map_err(WorktreeError::GitSpawn)?;
        if out.success {
            Ok(out)
        } else {
            Err(WorktreeError::GitCommand {
                command: args.join(" "),
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }

    fn branch_exists(&self, repo_path: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        matches!(
            self.git
                .run_git(repo_path, &["rev-parse", "--verify", "--quiet", &reference]),
            Ok(out) if out.success
        )
    }

    fn current_branch(&self, path: &Path) -> Option<String> {
        match self.git.run_git(path, &["rev-parse", "--abbrev-ref", "HEAD"]) {
            Ok(out) if out.success => {
                let name = out.stdout.trim();
                (!name.is_empty()).then(|| name.to_string())
            }
            _ => None,
        }
    }

    /// Prefer the remote's symbolic HEAD, then local `main`, then `master`.
    fn default_branch(&self, repo_path: &Path) -> Result<String> {
        if let Ok(out) = self.git.run_git(
            repo_path,
            &["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"],
        ) {
            let name = out.stdout.trim();
            if out.success && !name.is_empty() {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(repo_path, candidate) {
                return Ok(candidate.to_string());
            }
        }
        Err(WorktreeError::NoDefaultBranch(
            repo_path.display().to_string(),
        ))
    }

    /// Branches named after a work item, for teardown without metadata.
    fn branches_for_item(&self, repo_path: &Path, work_item: u64) -> Vec<String> {
        let exact = format!("feature/issue-{work_item}");
        let titled = format!("feature/issue-{work_item}-*");
        match self.git.run_git(
            repo_path,
            &["branch", "--list", "--format=%(refname:short)", &exact, &titled],
        ) {
            Ok(out) if out.success => out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers every git call with success and an empty output, except the
    /// calls matched by `overrides` (first matching prefix wins).
    struct ScriptedGit {
        overrides: Vec<(Vec<&'static str>, GitOutput)>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedGit {
        fn new(overrides: Vec<(Vec<&'static str>, GitOutput)>) -> Self {
            Self {
                overrides,
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl GitRunner for ScriptedGit {
        fn run_git(&self, _dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            for (prefix, out) in &self.overrides {
                if args.starts_with(prefix) {
                    return Ok(out.clone());
                }
            }
            Ok(GitOutput {
                success: true,
                ..GitOutput::default()
            })
        }
    }

    fn failed() -> GitOutput {
        GitOutput {
            success: false,
            ..GitOutput::default()
        }
    }

    #[test]
    fn non_repo_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let git = ScriptedGit::new(vec![(vec!["rev-parse", "--git-dir"], failed())]);
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(git),
        );
        let err = manager.create(tmp.path(), 1, "x").unwrap_err();
        assert_eq!(err.code(), "not_a_git_repo");
    }

    #[test]
    fn occupied_path_is_never_touched() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = ScriptedGit::new(vec![(vec!["remote"], failed())]);
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(git),
        );

        let occupied = manager.worktree_path("repo", 3);
        std::fs::create_dir_all(&occupied).unwrap();
        std::fs::write(occupied.join("notes.txt"), "keep me").unwrap();

        let err = manager.create(&repo, 3, "Whatever").unwrap_err();
        assert!(matches!(err, WorktreeError::PathOccupied(_)));
        assert!(occupied.join("notes.txt").exists());
    }

    #[test]
    fn mark_deps_installed_without_record_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(ScriptedGit::new(vec![])),
        );
        assert!(!manager.mark_deps_installed(tmp.path(), 9).unwrap());
        assert!(!tmp.path().join("worktrees.json").exists());
    }

    #[test]
    fn missing_default_branch_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let git = ScriptedGit::new(vec![
            (vec!["remote"], failed()),
            (vec!["symbolic-ref"], failed()),
            (vec!["rev-parse", "--verify"], failed()),
        ]);
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(git),
        );
        let err = manager.create(tmp.path(), 5, "New thing").unwrap_err();
        assert_eq!(err.code(), "no_default_branch");
    }

    #[test]
    fn failed_prune_does_not_block_create() {
        let tmp = tempfile::tempdir().unwrap();
        let git = ScriptedGit::new(vec![
            (vec!["remote"], failed()),
            (vec!["worktree", "prune"], failed()),
            (vec!["rev-parse", "--verify"], failed()),
            (
                vec!["symbolic-ref"],
                GitOutput {
                    success: true,
                    stdout: "origin/main\n".into(),
                    stderr: String::new(),
                },
            ),
        ]);
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(git),
        );

        let record = manager.create(tmp.path(), 4, "Prune me").unwrap();
        assert_eq!(record.branch, "feature/issue-4-prune-me");
        assert!(manager.store.load().worktrees.contains_key(&record_key(&record.repo_slug, 4)));
    }

    #[test]
    fn git_failure_preserves_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let git = ScriptedGit::new(vec![
            (vec!["remote"], failed()),
            (vec!["rev-parse", "--verify"], failed()),
            (
                vec!["symbolic-ref"],
                GitOutput {
                    success: true,
                    stdout: "origin/main\n".into(),
                    stderr: String::new(),
                },
            ),
            (
                vec!["worktree", "add"],
                GitOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "fatal: invalid reference: origin/main".into(),
                },
            ),
        ]);
        let manager = WorktreeManager::with_git_runner(
            tmp.path().join("wt"),
            tmp.path().join("worktrees.json"),
            Box::new(git),
        );
        match manager.create(tmp.path(), 5, "New thing").unwrap_err() {
            WorktreeError::GitCommand { stderr, command, .. } => {
                assert!(stderr.contains("invalid reference"));
                assert!(command.starts_with("worktree add -b feature/issue-5-new-thing"));
            }
            other => panic!("expected GitCommand, got {other:?}"),
        }
    }
}
