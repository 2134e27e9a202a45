use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use sw_agents::pipeline::SetupRequest;
use sw_core::session_registry::SessionKind;

use super::{print_json, Services};

pub async fn run(
    services: &Services,
    project: String,
    repo: PathBuf,
    issue: u64,
    title: String,
    kind: SessionKind,
) -> Result<()> {
    let mut request = SetupRequest::planning(project, repo, issue, title);
    request.kind = kind;

    let (tx, rx) = flume::unbounded();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            print_json(&event)?;
        }
        anyhow::Ok(())
    });

    let outcome = services.pipeline().run(&request, &tx).await;
    drop(tx);
    printer.await.context("event printer panicked")??;

    if outcome.is_none() {
        bail!("setup for issue #{issue} failed");
    }
    Ok(())
}
