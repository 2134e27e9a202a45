#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sw_core::config::Config;
use sw_core::session_registry::SessionKind;
use sw_integrations::runtime::PermissionResponse;

/// swarmyard -- isolated worktrees, agent sessions and swarm observation per work item.
#[derive(Parser, Debug)]
#[command(name = "swarmyard", version, about)]
struct Cli {
    /// Config file (defaults to ~/.swarmyard/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON regardless of the configured format.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage per-issue git worktrees.
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },

    /// Prepare a work item: worktree, dependencies, session, seed prompt.
    /// Prints one JSON event per line.
    Setup {
        project: String,
        repo: PathBuf,
        issue: u64,
        title: String,
        /// Session kind to prepare.
        #[arg(long, default_value = "planning", value_parser = parse_setup_kind)]
        kind: SessionKind,
    },

    /// Start or observe an agent swarm.
    Swarm {
        #[command(subcommand)]
        action: SwarmAction,
    },

    /// Inspect or reset recorded sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Remove every session, the worktree and the workflow label for an issue.
    Teardown {
        project: String,
        repo: PathBuf,
        issue: u64,
    },
}

#[derive(Subcommand, Debug)]
enum WorktreeAction {
    /// Create (or resume) the worktree for an issue.
    Create {
        repo: PathBuf,
        issue: u64,
        title: String,
    },
    /// Show the recorded worktree for an issue.
    Get { repo: PathBuf, issue: u64 },
    /// Remove the worktree and its record.
    Delete { repo: PathBuf, issue: u64 },
    /// List valid worktrees of a repository.
    List { repo: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SwarmAction {
    /// Create a swarm orchestrator session for an epic.
    Start {
        project: String,
        repo: PathBuf,
        issue: u64,
        title: String,
        epic: String,
    },
    /// Stream swarm events as JSON lines until Ctrl-C.
    Watch { project: String, issue: u64 },
    /// Answer a pending permission request.
    Respond {
        project: String,
        issue: u64,
        session: String,
        permission: String,
        /// once, always or reject.
        response: PermissionResponse,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// Print every mapping as a JSON line.
    List,
    /// Abort a session and forget its mapping.
    Reset {
        project: String,
        issue: u64,
        kind: SessionKind,
    },
}

fn parse_setup_kind(raw: &str) -> Result<SessionKind, String> {
    match raw.parse::<SessionKind>()? {
        SessionKind::Swarm => Err("use `swarm start` for swarm sessions".to_string()),
        kind => Ok(kind),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    sw_telemetry::logging::init_from_config("swarmyard", &config.general, cli.json_logs);

    let services = commands::Services::from_config(config);

    match cli.command {
        Commands::Worktree { action } => match action {
            WorktreeAction::Create { repo, issue, title } => {
                commands::worktree::create(&services, &repo, issue, &title)?
            }
            WorktreeAction::Get { repo, issue } => commands::worktree::get(&services, &repo, issue)?,
            WorktreeAction::Delete { repo, issue } => {
                commands::worktree::delete(&services, &repo, issue)?
            }
            WorktreeAction::List { repo } => commands::worktree::list(&services, &repo)?,
        },
        Commands::Setup {
            project,
            repo,
            issue,
            title,
            kind,
        } => commands::setup::run(&services, project, repo, issue, title, kind).await?,
        Commands::Swarm { action } => match action {
            SwarmAction::Start {
                project,
                repo,
                issue,
                title,
                epic,
            } => commands::swarm::start(&services, project, repo, issue, title, epic).await?,
            SwarmAction::Watch { project, issue } => {
                commands::swarm::watch(&services, project, issue).await?
            }
            SwarmAction::Respond {
                project,
                issue,
                session,
                permission,
                response,
            } => {
                commands::swarm::respond(&services, &project, issue, &session, &permission, response)
                    .await?
            }
        },
        Commands::Sessions { action } => match action {
            SessionsAction::List => commands::sessions::list(&services)?,
            SessionsAction::Reset {
                project,
                issue,
                kind,
            } => commands::sessions::reset(&services, project, issue, kind).await?,
        },
        Commands::Teardown {
            project,
            repo,
            issue,
        } => commands::sessions::teardown(&services, &project, &repo, issue).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn setup_defaults_to_planning() {
        let cli = Cli::try_parse_from(["swarmyard", "setup", "proj", "/tmp/repo", "42", "Add dark mode"])
            .unwrap();
        match cli.command {
            Commands::Setup { kind, issue, .. } => {
                assert_eq!(kind, SessionKind::Planning);
                assert_eq!(issue, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setup_rejects_swarm_kind() {
        let err = Cli::try_parse_from([
            "swarmyard", "setup", "proj", "/tmp/repo", "42", "t", "--kind", "swarm",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("swarm start"));
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "swarmyard", "sessions", "list", "--json-logs", "--config", "/tmp/c.toml",
        ])
        .unwrap();
        assert!(cli.json_logs);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn permission_response_is_parsed() {
        let cli = Cli::try_parse_from([
            "swarmyard", "swarm", "respond", "proj", "42", "ses_a", "per_1", "always",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Swarm {
                action: SwarmAction::Respond {
                    response: PermissionResponse::Always,
                    ..
                }
            }
        ));
    }
}
