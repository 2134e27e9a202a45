//! Swarm watch: one projector per observer connection.
//!
//! A single task owns the connection. It select-waits over cancellation,
//! the raw runtime feed, the progress timer and the heartbeat timer, and
//! handles one input at a time, so the projector needs no locking.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use sw_core::config::WatchConfig;
use sw_core::session_registry::{MappingKey, SessionKind, SessionRegistry};
use sw_integrations::raw_event::RawEvent;
use sw_integrations::runtime::{AgentRuntime, EventStream, RuntimeError};
use sw_integrations::tasks::TaskStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::WatchEvent;
use crate::progress;
use crate::projector::SwarmProjector;

/// The work item whose swarm is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub project_id: String,
    pub work_item: u64,
}

impl WatchTarget {
    pub fn new(project_id: impl Into<String>, work_item: u64) -> Self {
        Self {
            project_id: project_id.into(),
            work_item,
        }
    }

    fn key(&self) -> MappingKey {
        MappingKey::new(self.project_id.clone(), self.work_item, SessionKind::Swarm)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub progress_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchSettings {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            progress_interval: Duration::from_secs(cfg.progress_interval_secs),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
        }
    }
}

/// Factory for watch connections. Cheap to clone.
#[derive(Clone)]
pub struct SwarmWatch {
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn AgentRuntime>,
    tasks: Arc<dyn TaskStore>,
    settings: WatchSettings,
}

/// Handle to a running watch connection.
pub struct WatchHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Ask the connection to stop. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the connection task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "swarm watch task failed");
        }
    }
}

impl SwarmWatch {
    pub fn new(
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        tasks: Arc<dyn TaskStore>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            registry,
            runtime,
            tasks,
            settings,
        }
    }

    /// Start a connection on the current runtime, pushing events to `sink`.
    pub fn spawn(&self, target: WatchTarget, sink: flume::Sender<WatchEvent>) -> WatchHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(target, sink, cancel_rx).await });
        WatchHandle {
            cancel: cancel_tx,
            task,
        }
    }

    /// Drive one connection until cancellation, disconnect, or the raw feed
    /// ends. Every exit goes through the same cleanup.
    pub async fn run(
        &self,
        target: WatchTarget,
        sink: flume::Sender<WatchEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let key = target.key();
        let mut conn = Connection::new(sink);

        let Some(mapping) = self.registry.get(&key) else {
            conn.fail(format!(
                "no swarm session for work item {} in {}",
                target.work_item, target.project_id
            ));
            return;
        };
        let Some(work_dir) = mapping.worktree_path.clone() else {
            conn.fail(format!(
                "swarm session {} has no worktree",
                mapping.session_id
            ));
            return;
        };

        let mut projector = SwarmProjector::new(mapping.session_id.clone(), mapping.epic_id.clone());

        // Subscribe before seeding so nothing spawned in between is missed.
        match self.runtime.subscribe_events(&work_dir).await {
            Ok(stream) => conn.feed = Some(stream),
            Err(e) => {
                conn.fail(format!("could not subscribe to runtime events: {e}"));
                return;
            }
        }

        match self
            .runtime
            .get_child_sessions(&work_dir, &mapping.session_id)
            .await
        {
            Ok(children) => projector.seed(children),
            Err(e) => warn!(session = %mapping.session_id, error = %e, "could not list child sessions"),
        }

        match self.runtime.list_pending_permissions(&work_dir).await {
            Ok(list) => projector.seed_permissions(list),
            Err(RuntimeError::Unsupported(_)) => {
                warn!("runtime cannot list pending permissions; queue starts empty")
            }
            Err(e) => warn!(error = %e, "could not list pending permissions"),
        }

        info!(
            project = %target.project_id,
            work_item = target.work_item,
            orchestrator = %projector.orchestrator_id(),
            agents = projector.agents().count(),
            "swarm watch connected"
        );

        if !conn.emit(projector.connected_event()) {
            conn.cleanup("disconnected");
            return;
        }
        if !self
            .check_progress(&key, &work_dir, &mut projector, &mut conn, &mut cancel)
            .await
        {
            conn.cleanup(stop_reason(&cancel));
            return;
        }

        let mut progress_timer = interval(self.settings.progress_interval);
        progress_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        progress_timer.tick().await;
        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let reason = loop {
            if *cancel.borrow() {
                break "cancelled";
            }
            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break "cancelled";
                    }
                }
                next = next_event(&mut conn.feed) => {
                    let Some(event) = next else {
                        break "raw feed ended";
                    };
                    if !conn.emit_all(projector.apply(event)) {
                        break "disconnected";
                    }
                }
                _ = progress_timer.tick() => {
                    if !self
                        .check_progress(&key, &work_dir, &mut projector, &mut conn, &mut cancel)
                        .await
                    {
                        break stop_reason(&cancel);
                    }
                }
                _ = heartbeat.tick() => {
                    if !conn.emit(WatchEvent::Heartbeat { at: Utc::now() }) {
                        break "disconnected";
                    }
                }
            }
        };
        conn.cleanup(reason);
    }

    /// Recompute progress and forward whatever the projector emits.
    ///
    /// The task listing races cancellation: a cancelled connection drops the
    /// in-flight listing and neither emits nor touches the registry. Returns
    /// `false` once the observer is gone or the connection was cancelled.
    async fn check_progress(
        &self,
        key: &MappingKey,
        work_dir: &Path,
        projector: &mut SwarmProjector,
        conn: &mut Connection,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        let Some(epic) = projector.epic_id().map(str::to_string) else {
            debug!("swarm mapping has no epic; skipping progress");
            return true;
        };
        let listing = tokio::select! {
            biased;

            _ = cancelled(cancel) => {
                debug!(epic = %epic, "cancelled during task listing");
                return false;
            }
            listing = self.tasks.list(work_dir) => listing,
        };
        let tasks = match listing {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(epic = %epic, code = e.code(), error = %e, "task listing failed");
                return true;
            }
        };

        let events = projector.apply_progress(progress::compute(&epic, &tasks));
        let finished = events
            .iter()
            .any(|e| matches!(e, WatchEvent::SwarmCompleted { .. }));
        if finished {
            info!(epic = %epic, "swarm completed");
            match self.registry.mark_completed(key) {
                Ok(true) => {}
                Ok(false) => warn!(epic = %epic, "swarm mapping vanished before completion"),
                Err(e) => warn!(epic = %epic, error = %e, "could not mark swarm completed"),
            }
        }
        conn.emit_all(events)
    }
}

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn stop_reason(cancel: &watch::Receiver<bool>) -> &'static str {
    if *cancel.borrow() || cancel.has_changed().is_err() {
        "cancelled"
    } else {
        "disconnected"
    }
}

async fn next_event(feed: &mut Option<EventStream>) -> Option<RawEvent> {
    match feed.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Output side of one connection.
///
/// Holds the sink and the raw-feed subscription; [`Connection::cleanup`]
/// releases both exactly once.
struct Connection {
    sink: Option<flume::Sender<WatchEvent>>,
    feed: Option<EventStream>,
    cleaned: bool,
}

impl Connection {
    fn new(sink: flume::Sender<WatchEvent>) -> Self {
        Self {
            sink: Some(sink),
            feed: None,
            cleaned: false,
        }
    }

    /// `false` when the observer is gone or the connection is closed.
    fn emit(&mut self, event: WatchEvent) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };
        debug!(kind = event.kind(), "watch event");
        sink.send(event).is_ok()
    }

    fn emit_all(&mut self, events: Vec<WatchEvent>) -> bool {
        events.into_iter().all(|e| self.emit(e))
    }

    fn fail(&mut self, message: String) {
        warn!(message = %message, "swarm watch failed");
        self.emit(WatchEvent::SwarmError {
            message,
            fatal: true,
        });
        self.cleanup("error");
    }

    fn cleanup(&mut self, reason: &str) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.feed = None;
        self.sink = None;
        info!(reason, "swarm watch closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup("dropped");
    }
}
