//! Task store client.
//!
//! The task database is reached through the `bd` CLI. Its JSON output has
//! drifted across versions, so raw records are decoded leniently and the
//! relationships (`parent_id`, `blocks`, `blocked_by`) are normalised after
//! the whole listing is read.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::process::{run_cli, CliError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Epic,
    Feature,
    Task,
    Bug,
    Chore,
    Other,
}

impl TaskKind {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "epic" => Self::Epic,
            "feature" => Self::Feature,
            "task" => Self::Task,
            "bug" => Self::Bug,
            "chore" => Self::Chore,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "in_progress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "closed" | "done" => Self::Closed,
            _ => Self::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: Option<u8>,
    pub parent_id: Option<String>,
    pub blocks: Vec<String>,
    pub blocked_by: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error("task store returned malformed JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TaskStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cli(e) => e.code(),
            Self::Decode(_) => "tasks_decode",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cli(e) => e.is_retryable(),
            Self::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Every task visible from `work_dir`, open and closed.
    async fn list(&self, work_dir: &Path) -> Result<Vec<TaskRecord>, TaskStoreError>;
}

/// [`TaskStore`] that shells out to `bd list --json --all`.
pub struct BeadsCli {
    bin: String,
    timeout: Duration,
}

impl BeadsCli {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TaskStore for BeadsCli {
    async fn list(&self, work_dir: &Path) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let out = run_cli(&self.bin, &["list", "--json", "--all"], work_dir, self.timeout).await?;
        let tasks = parse_listing(&out.stdout)?;
        debug!(count = tasks.len(), dir = %work_dir.display(), "task listing read");
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// Raw decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawTask {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    issue_type: Option<String>,
    #[serde(rename = "type", default)]
    type_: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    dependencies: Option<Vec<RawDependency>>,
    #[serde(default)]
    blocked_by: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawDependency {
    #[serde(default)]
    depends_on_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    dep_type: Option<String>,
    #[serde(default)]
    dependency_type: Option<String>,
}

fn parse_priority(v: &Value) -> Option<u8> {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => {
            let digits = s.trim().trim_start_matches(['P', 'p']);
            digits.parse().ok()
        }
        _ => None,
    }
}

/// `bd-a3f8.2` → `bd-a3f8`. Only a purely numeric suffix counts.
pub fn parent_from_dotted_id(id: &str) -> Option<&str> {
    let (head, tail) = id.rsplit_once('.')?;
    (!head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()))
        .then_some(head)
}

/// Decode a `bd list --json` document into normalised records.
///
/// Accepts either a bare array or an object wrapping it under `issues`.
pub fn parse_listing(json: &str) -> Result<Vec<TaskRecord>, serde_json::Error> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let items = match value {
        Value::Object(mut map) => map.remove("issues").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    let raw: Vec<RawTask> = serde_json::from_value(items)?;
    Ok(normalise(raw))
}

fn normalise(raw: Vec<RawTask>) -> Vec<TaskRecord> {
    let mut tasks: Vec<TaskRecord> = raw
        .into_iter()
        .map(|r| {
            let mut parent_id = r.parent.or(r.parent_id).filter(|p| !p.is_empty());
            let mut blocked_by: BTreeSet<String> =
                r.blocked_by.unwrap_or_default().into_iter().collect();

            for dep in r.dependencies.unwrap_or_default() {
                let Some(target) = dep.depends_on_id.or(dep.id) else {
                    continue;
                };
                if target == r.id {
                    continue;
                }
                let kind = dep
                    .dep_type
                    .or(dep.dependency_type)
                    .unwrap_or_else(|| "blocks".to_string());
                match kind.as_str() {
                    "parent-child" | "parent_child" | "parent" => {
                        if parent_id.is_none() {
                            parent_id = Some(target);
                        }
                    }
                    "blocks" => {
                        blocked_by.insert(target);
                    }
                    _ => {}
                }
            }

            if parent_id.is_none() {
                parent_id = parent_from_dotted_id(&r.id).map(str::to_string);
            }

            TaskRecord {
                kind: TaskKind::parse(r.issue_type.or(r.type_).as_deref().unwrap_or("task")),
                status: TaskStatus::parse(r.status.as_deref().unwrap_or("open")),
                priority: r.priority.as_ref().and_then(parse_priority),
                id: r.id,
                title: r.title.unwrap_or_default(),
                parent_id,
                blocks: Vec::new(),
                blocked_by: blocked_by.into_iter().collect(),
            }
        })
        .collect();

    let mut blocks: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for t in &tasks {
        for blocker in &t.blocked_by {
            blocks.entry(blocker.clone()).or_default().push(t.id.clone());
        }
    }
    for t in &mut tasks {
        if let Some(list) = blocks.remove(&t.id) {
            t.blocks = list;
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_ids_infer_parent() {
        assert_eq!(parent_from_dotted_id("bd-a3f8.2"), Some("bd-a3f8"));
        assert_eq!(parent_from_dotted_id("bd-a3f8.1.3"), Some("bd-a3f8.1"));
        assert_eq!(parent_from_dotted_id("bd-a3f8"), None);
        assert_eq!(parent_from_dotted_id("v1.x"), None);
        assert_eq!(parent_from_dotted_id(".3"), None);
    }

    #[test]
    fn tolerates_mixed_encodings() {
        let json = r#"[
            {"id": "bd-1", "title": "Epic", "issue_type": "epic", "status": "open", "priority": 1},
            {"id": "bd-2", "title": "A", "type": "task", "status": "in_progress", "priority": "P2",
             "parent": "bd-1"},
            {"id": "bd-3", "title": "B", "issue_type": "task", "status": "closed",
             "dependencies": [{"depends_on_id": "bd-1", "type": "parent-child"},
                              {"depends_on_id": "bd-2", "type": "blocks"}]},
            {"id": "bd-1.4", "title": "C", "status": "open", "blocked_by": ["bd-3"]}
        ]"#;
        let tasks = parse_listing(json).unwrap();
        let by_id: BTreeMap<_, _> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        assert_eq!(by_id["bd-1"].kind, TaskKind::Epic);
        assert_eq!(by_id["bd-1"].priority, Some(1));
        assert_eq!(by_id["bd-2"].priority, Some(2));
        assert_eq!(by_id["bd-2"].status, TaskStatus::InProgress);
        assert_eq!(by_id["bd-2"].parent_id.as_deref(), Some("bd-1"));
        assert_eq!(by_id["bd-3"].parent_id.as_deref(), Some("bd-1"));
        assert_eq!(by_id["bd-3"].blocked_by, vec!["bd-2".to_string()]);
        assert_eq!(by_id["bd-1.4"].parent_id.as_deref(), Some("bd-1"));
        assert_eq!(by_id["bd-1.4"].kind, TaskKind::Task);

        // Inverse edges.
        assert_eq!(by_id["bd-2"].blocks, vec!["bd-3".to_string()]);
        assert_eq!(by_id["bd-3"].blocks, vec!["bd-1.4".to_string()]);
    }

    #[test]
    fn accepts_wrapped_and_empty_output() {
        let wrapped = r#"{"issues": [{"id": "bd-9", "title": "x", "status": "closed"}]}"#;
        let tasks = parse_listing(wrapped).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Closed);

        assert!(parse_listing("").unwrap().is_empty());
        assert!(parse_listing("  \n").unwrap().is_empty());
        assert!(parse_listing("not json").is_err());
    }

    #[test]
    fn null_fields_decode_as_empty() {
        let json = r#"[
            {"id": "bd-5", "title": null, "issue_type": null, "status": null, "priority": null,
             "parent": null, "dependencies": null, "blocked_by": null},
            {"id": "bd-5.1", "title": "Child", "status": "closed", "dependencies": null}
        ]"#;
        let tasks = parse_listing(json).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "");
        assert_eq!(tasks[0].kind, TaskKind::Task);
        assert_eq!(tasks[0].status, TaskStatus::Open);
        assert!(tasks[0].blocked_by.is_empty());
        assert_eq!(tasks[0].blocks, Vec::<String>::new());
        assert_eq!(tasks[1].parent_id.as_deref(), Some("bd-5"));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_cli_error() {
        let store = BeadsCli::new("swarmyard-no-such-bd", Duration::from_secs(5));
        let err = store.list(Path::new(".")).await.unwrap_err();
        assert_eq!(err.code(), "cli_spawn");
    }
}
