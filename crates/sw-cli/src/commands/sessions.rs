use std::path::Path;

use anyhow::{Context, Result};
use sw_core::session_registry::{MappingKey, SessionKind};

use super::{print_json, Services};

pub fn list(services: &Services) -> Result<()> {
    for mapping in services.registry.snapshot() {
        print_json(&mapping)?;
    }
    Ok(())
}

pub async fn reset(services: &Services, project: String, issue: u64, kind: SessionKind) -> Result<()> {
    let key = MappingKey::new(project, issue, kind);
    let removed = services
        .lifecycle()
        .reset_session(&key)
        .await
        .with_context(|| format!("resetting {kind} session for issue #{issue}"))?;
    if removed {
        tracing::info!(issue, kind = %kind, "session reset");
    } else {
        tracing::info!(issue, kind = %kind, "no session recorded");
    }
    Ok(())
}

pub async fn teardown(services: &Services, project: &str, repo: &Path, issue: u64) -> Result<()> {
    services
        .lifecycle()
        .teardown(project, repo, issue)
        .await
        .with_context(|| format!("tearing down issue #{issue}"))?;
    tracing::info!(issue, "work item torn down");
    Ok(())
}
