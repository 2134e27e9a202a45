pub mod sessions;
pub mod setup;
pub mod swarm;
pub mod worktree;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sw_agents::lifecycle::Lifecycle;
use sw_agents::pipeline::{SetupPipeline, ShellInstaller};
use sw_agents::watch::{SwarmWatch, WatchSettings};
use sw_core::config::Config;
use sw_core::session_registry::SessionRegistry;
use sw_core::worktree::WorktreeManager;
use sw_integrations::opencode::OpenCodeClient;
use sw_integrations::retry::RetryPolicy;
use sw_integrations::runtime::AgentRuntime;
use sw_integrations::tasks::{BeadsCli, TaskStore};
use sw_integrations::tracker::{GhLabelClient, IssueTracker};

/// Services wired from config, shared by every command.
pub struct Services {
    pub config: Config,
    pub worktrees: Arc<WorktreeManager>,
    pub registry: Arc<SessionRegistry>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub tracker: Arc<dyn IssueTracker>,
    pub tasks: Arc<dyn TaskStore>,
    pub installer: Arc<ShellInstaller>,
}

impl Services {
    pub fn from_config(config: Config) -> Self {
        let worktrees = WorktreeManager::new(config.worktrees_root(), config.worktrees_store_path())
            .with_slug_max_len(config.worktrees.branch_slug_max_len);
        let runtime = OpenCodeClient::new(
            config.runtime.base_url.clone(),
            Duration::from_secs(config.runtime.request_timeout_secs),
        );
        let tracker = GhLabelClient::new(
            config.tracker.bin.clone(),
            config.tracker.workflow_label.clone(),
        )
        .with_timeout(Duration::from_secs(config.tracker.timeout_secs))
        .with_retry(RetryPolicy::new(
            config.tracker.max_attempts,
            Duration::from_millis(config.tracker.base_backoff_ms),
        ));
        let tasks = BeadsCli::new(
            config.tasks.bin.clone(),
            Duration::from_secs(config.tasks.timeout_secs),
        );
        let installer = ShellInstaller::new(
            &config.worktrees.install_command,
            Duration::from_secs(config.worktrees.install_timeout_secs),
        );

        Self {
            worktrees: Arc::new(worktrees),
            registry: Arc::new(SessionRegistry::new(config.sessions_store_path())),
            runtime: Arc::new(runtime),
            tracker: Arc::new(tracker),
            tasks: Arc::new(tasks),
            installer: Arc::new(installer),
            config,
        }
    }

    pub fn pipeline(&self) -> SetupPipeline {
        SetupPipeline::new(
            self.worktrees.clone(),
            self.registry.clone(),
            self.runtime.clone(),
            self.tracker.clone(),
            self.installer.clone(),
        )
        .with_seed_command(self.config.setup.seed_command.clone())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(
            self.worktrees.clone(),
            self.registry.clone(),
            self.runtime.clone(),
            self.tracker.clone(),
        )
        .with_swarm_command(self.config.setup.swarm_command.clone())
    }

    pub fn watch(&self) -> SwarmWatch {
        SwarmWatch::new(
            self.registry.clone(),
            self.runtime.clone(),
            self.tasks.clone(),
            WatchSettings::from(&self.config.watch),
        )
    }
}

/// Write one value as a single JSON line on stdout and flush it.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let line = serde_json::to_string(value).context("encoding output")?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").context("writing to stdout")?;
    out.flush().context("flushing stdout")
}
