use std::path::Path;

use anyhow::{Context, Result};

use super::{print_json, Services};

pub fn create(services: &Services, repo: &Path, issue: u64, title: &str) -> Result<()> {
    let record = services
        .worktrees
        .create(repo, issue, title)
        .with_context(|| format!("creating worktree for issue #{issue}"))?;
    print_json(&record)
}

pub fn get(services: &Services, repo: &Path, issue: u64) -> Result<()> {
    let record = services
        .worktrees
        .get(repo, issue)
        .with_context(|| format!("reading worktree record for issue #{issue}"))?;
    print_json(&record)
}

pub fn delete(services: &Services, repo: &Path, issue: u64) -> Result<()> {
    services
        .worktrees
        .delete(repo, issue)
        .with_context(|| format!("deleting worktree for issue #{issue}"))?;
    tracing::info!(issue, "worktree deleted");
    Ok(())
}

pub fn list(services: &Services, repo: &Path) -> Result<()> {
    let records = services
        .worktrees
        .list(repo)
        .with_context(|| format!("listing worktrees of {}", repo.display()))?;
    for record in &records {
        print_json(record)?;
    }
    Ok(())
}
