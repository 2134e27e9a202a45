use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use sw_agents::events::WatchEvent;
use sw_agents::lifecycle::SwarmRequest;
use sw_agents::watch::WatchTarget;
use sw_integrations::runtime::PermissionResponse;

use super::{print_json, Services};

pub async fn start(
    services: &Services,
    project: String,
    repo: PathBuf,
    issue: u64,
    title: String,
    epic: String,
) -> Result<()> {
    let request = SwarmRequest {
        project_id: project,
        repo_path: repo,
        work_item: issue,
        title,
        epic_id: epic,
    };
    let mapping = services
        .lifecycle()
        .start_swarm(&request)
        .await
        .with_context(|| format!("starting swarm for issue #{issue}"))?;
    print_json(&mapping)
}

/// Stream watch events until the watch ends or Ctrl-C is pressed.
pub async fn watch(services: &Services, project: String, issue: u64) -> Result<()> {
    let (tx, rx) = flume::unbounded();
    let handle = services.watch().spawn(WatchTarget::new(project, issue), tx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut fatal = None;

    loop {
        tokio::select! {
            event = rx.recv_async() => {
                let Ok(event) = event else { break };
                if let WatchEvent::SwarmError { fatal: true, message } = &event {
                    fatal = Some(message.clone());
                }
                if let Err(err) = print_json(&event) {
                    handle.cancel();
                    handle.join().await;
                    return Err(err);
                }
            }
            signal = &mut ctrl_c, if !interrupted => {
                signal.context("listening for Ctrl-C")?;
                tracing::info!(issue, "interrupted, closing watch");
                interrupted = true;
                handle.cancel();
            }
        }
    }
    handle.join().await;

    if let Some(message) = fatal {
        bail!("watch for issue #{issue} failed: {message}");
    }
    Ok(())
}

pub async fn respond(
    services: &Services,
    project: &str,
    issue: u64,
    session: &str,
    permission: &str,
    response: PermissionResponse,
) -> Result<()> {
    let accepted = services
        .lifecycle()
        .respond_to_permission(project, issue, session, permission, response)
        .await
        .with_context(|| format!("answering permission {permission}"))?;
    if !accepted {
        bail!("permission {permission} was not accepted by the runtime");
    }
    tracing::info!(permission, response = response.as_str(), "permission answered");
    Ok(())
}
