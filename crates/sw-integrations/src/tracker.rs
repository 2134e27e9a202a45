use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::process::{run_cli, CliError};
use crate::retry::{with_backoff, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("issue tracker call failed: {0}")]
    Cli(#[from] CliError),
}

impl TrackerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cli(e) => e.code(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cli(e) => e.is_retryable(),
        }
    }
}

/// Workflow labels on the issue tracker.
///
/// Both operations are idempotent: adding a present label or removing an
/// absent one succeeds.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn add_label(&self, repo_path: &Path, issue: u64) -> Result<(), TrackerError>;
    async fn remove_label(&self, repo_path: &Path, issue: u64) -> Result<(), TrackerError>;
}

/// [`IssueTracker`] driving the GitHub CLI.
pub struct GhLabelClient {
    bin: String,
    label: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GhLabelClient {
    pub fn new(bin: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            label: label.into(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn edit(&self, repo_path: &Path, issue: u64, flag: &str) -> Result<(), TrackerError> {
        let issue_arg = issue.to_string();
        let repo: PathBuf = repo_path.to_path_buf();
        let result = with_backoff(self.retry, "gh issue edit", CliError::is_retryable, || {
            let repo = repo.clone();
            let issue_arg = issue_arg.clone();
            async move {
                run_cli(
                    &self.bin,
                    &["issue", "edit", &issue_arg, flag, &self.label],
                    &repo,
                    self.timeout,
                )
                .await
            }
        })
        .await;

        match result {
            Ok(_) => {
                info!(issue, label = %self.label, op = flag, "issue label updated");
                Ok(())
            }
            Err(e) if is_idempotent_outcome(&e) => {
                debug!(issue, label = %self.label, op = flag, "label already in requested state");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `gh` reports an already-applied or already-absent label as a failure.
fn is_idempotent_outcome(e: &CliError) -> bool {
    match e {
        CliError::Failed { stderr, .. } => {
            let lower = stderr.to_ascii_lowercase();
            lower.contains("already") || lower.contains("does not have")
        }
        _ => false,
    }
}

#[async_trait]
impl IssueTracker for GhLabelClient {
    async fn add_label(&self, repo_path: &Path, issue: u64) -> Result<(), TrackerError> {
        self.edit(repo_path, issue, "--add-label").await
    }

    async fn remove_label(&self, repo_path: &Path, issue: u64) -> Result<(), TrackerError> {
        self.edit(repo_path, issue, "--remove-label").await
    }
}
