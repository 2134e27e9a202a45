use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sw_integrations::tasks::{TaskKind, TaskRecord, TaskStatus};

/// Completion counts for the tasks under one epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub pending: u32,
    pub percentage: u32,
}

impl ProgressSnapshot {
    pub fn from_counts(completed: u32, in_progress: u32, pending: u32) -> Self {
        let total = completed + in_progress + pending;
        let percentage = if total == 0 {
            0
        } else {
            (f64::from(completed) / f64::from(total) * 100.0).round() as u32
        };
        Self {
            total,
            completed,
            in_progress,
            pending,
            percentage,
        }
    }

    /// The reported percentage reached 100 on a non-empty epic.
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.percentage >= 100
    }

    /// The pair that decides whether a snapshot is worth re-emitting.
    pub fn dedup_key(&self) -> (u32, u32) {
        (self.completed, self.total)
    }
}

/// Every transitive descendant of `root`, in breadth-first order.
///
/// Walks a parent → children index with an explicit frontier, so records
/// may appear in any order in `tasks`. The root itself is excluded and
/// parent cycles terminate.
pub fn collect_descendants<'a>(root: &str, tasks: &'a [TaskRecord]) -> Vec<&'a TaskRecord> {
    let mut children: HashMap<&str, Vec<&'a TaskRecord>> = HashMap::new();
    for task in tasks {
        if let Some(parent) = task.parent_id.as_deref() {
            children.entry(parent).or_default().push(task);
        }
    }

    let mut seen: HashSet<&str> = HashSet::from([root]);
    let mut frontier: VecDeque<&str> = VecDeque::from([root]);
    let mut out = Vec::new();

    while let Some(id) = frontier.pop_front() {
        let Some(kids) = children.get(id) else {
            continue;
        };
        for &kid in kids {
            if seen.insert(kid.id.as_str()) {
                out.push(kid);
                frontier.push_back(kid.id.as_str());
            }
        }
    }
    out
}

/// Count the `task`-kind descendants of `root` by status.
pub fn compute(root: &str, tasks: &[TaskRecord]) -> ProgressSnapshot {
    let (mut completed, mut in_progress, mut pending) = (0u32, 0u32, 0u32);
    for task in collect_descendants(root, tasks) {
        if task.kind != TaskKind::Task {
            continue;
        }
        match task.status {
            TaskStatus::Closed => completed += 1,
            TaskStatus::InProgress => in_progress += 1,
            TaskStatus::Open | TaskStatus::Blocked => pending += 1,
        }
    }
    ProgressSnapshot::from_counts(completed, in_progress, pending)
}
