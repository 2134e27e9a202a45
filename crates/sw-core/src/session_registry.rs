use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{JsonStore, StoreError, Versioned, CURRENT_VERSION};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What an agent session was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Discussion,
    Planning,
    Swarm,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Discussion => "discussion",
            SessionKind::Planning => "planning",
            SessionKind::Swarm => "swarm",
        }
    }

    /// Planning and swarm sessions run inside a worktree.
    pub fn requires_worktree(self) -> bool {
        matches!(self, SessionKind::Planning | SessionKind::Swarm)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discussion" => Ok(SessionKind::Discussion),
            "planning" => Ok(SessionKind::Planning),
            "swarm" => Ok(SessionKind::Swarm),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    #[default]
    Active,
    Completed,
}

/// Identity of a mapping: one per (project, work item, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub project_id: String,
    pub work_item: u64,
    pub kind: SessionKind,
}

impl MappingKey {
    pub fn new(project_id: impl Into<String>, work_item: u64, kind: SessionKind) -> Self {
        Self {
            project_id: project_id.into(),
            work_item,
            kind,
        }
    }

    fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.project_id, self.work_item, self.kind)
    }
}

/// Durable link between a work item and a live agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMapping {
    pub project_id: String,
    pub work_item: u64,
    pub kind: SessionKind,
    pub session_id: String,
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    /// Orchestration root (epic) for swarm sessions.
    #[serde(default)]
    pub epic_id: Option<String>,
    #[serde(default)]
    pub status: MappingStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl SessionMapping {
    pub fn new(key: &MappingKey, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_id: key.project_id.clone(),
            work_item: key.work_item,
            kind: key.kind,
            session_id: session_id.into(),
            worktree_path: None,
            epic_id: None,
            status: MappingStatus::Active,
            created_at: now,
            last_accessed_at: now,
        }
    }

    pub fn with_worktree(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.project_id.clone(), self.work_item, self.kind)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionDoc {
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionMapping>,
}

impl Default for SessionDoc {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl Versioned for SessionDoc {
    fn version(&self) -> u32 {
        self.version
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} session for work item {work_item} requires a worktree path")]
    MissingWorktree { kind: SessionKind, work_item: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// File-backed map from (project, work item, kind) to agent session.
///
/// Backed by a single JSON document rewritten atomically on every mutation.
/// A missing or corrupt file reads as an empty registry.
pub struct SessionRegistry {
    store: JsonStore<SessionDoc>,
}

impl SessionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn get(&self, key: &MappingKey) -> Option<SessionMapping> {
        self.store.load().sessions.get(&key.storage_key()).cloned()
    }

    /// Insert or replace the mapping for `mapping.key()`.
    ///
    /// An existing mapping's `created_at` is kept; `last_accessed_at` is
    /// refreshed. Returns the mapping as stored.
    pub fn save(&self, mut mapping: SessionMapping) -> Result<SessionMapping, RegistryError> {
        if mapping.kind.requires_worktree() && mapping.worktree_path.is_none() {
            return Err(RegistryError::MissingWorktree {
                kind: mapping.kind,
                work_item: mapping.work_item,
            });
        }

        let storage_key = mapping.key().storage_key();
        let stored = self.store.update(move |doc| {
            if let Some(existing) = doc.sessions.get(&storage_key) {
                mapping.created_at = existing.created_at;
            }
            mapping.last_accessed_at = Utc::now();
            doc.sessions.insert(storage_key, mapping.clone());
            mapping
        })?;

        debug!(
            project = %stored.project_id,
            work_item = stored.work_item,
            kind = %stored.kind,
            session = %stored.session_id,
            "session mapping saved"
        );
        Ok(stored)
    }

    /// Delete a mapping. Returns whether one existed.
    pub fn remove(&self, key: &MappingKey) -> Result<bool, RegistryError> {
        let storage_key = key.storage_key();
        if !self.store.load().sessions.contains_key(&storage_key) {
            return Ok(false);
        }
        Ok(self
            .store
            .update(|doc| doc.sessions.remove(&storage_key).is_some())?)
    }

    /// Refresh `last_accessed_at` only. Returns whether a mapping existed.
    pub fn touch(&self, key: &MappingKey) -> Result<bool, RegistryError> {
        self.modify(key, |m| m.last_accessed_at = Utc::now())
    }

    /// Flag a mapping's work as finished. Returns whether a mapping existed.
    pub fn mark_completed(&self, key: &MappingKey) -> Result<bool, RegistryError> {
        self.modify(key, |m| {
            m.status = MappingStatus::Completed;
            m.last_accessed_at = Utc::now();
        })
    }

    /// Point-in-time copy of every mapping.
    pub fn snapshot(&self) -> Vec<SessionMapping> {
        self.store.load().sessions.into_values().collect()
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<SessionMapping> {
        self.store
            .load()
            .sessions
            .into_values()
            .find(|m| m.session_id == session_id)
    }

    fn modify(
        &self,
        key: &MappingKey,
        f: impl FnOnce(&mut SessionMapping),
    ) -> Result<bool, RegistryError> {
        let storage_key = key.storage_key();
        if !self.store.load().sessions.contains_key(&storage_key) {
            return Ok(false);
        }
        Ok(self.store.update(|doc| match doc.sessions.get_mut(&storage_key) {
            Some(mapping) => {
                f(mapping);
                true
            }
            None => false,
        })?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_registry() -> (SessionRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let registry = SessionRegistry::new(dir.path().join("sessions.json"));
        (registry, dir)
    }

    fn planning(project: &str, item: u64, session: &str) -> SessionMapping {
        SessionMapping::new(&MappingKey::new(project, item, SessionKind::Planning), session)
            .with_worktree(format!("/wt/issue-{item}"))
    }

    #[test]
    fn save_then_get_returns_session() {
        let (registry, _dir) = temp_registry();
        for kind in [SessionKind::Discussion, SessionKind::Planning, SessionKind::Swarm] {
            let key = MappingKey::new("proj", 42, kind);
            let mapping = SessionMapping::new(&key, format!("ses_{kind}")).with_worktree("/wt");
            registry.save(mapping).unwrap();
            assert_eq!(registry.get(&key).unwrap().session_id, format!("ses_{kind}"));
        }
        assert_eq!(registry.snapshot().len(), 3);
    }

    #[test]
    fn resave_preserves_created_at() {
        let (registry, _dir) = temp_registry();
        let first = registry.save(planning("proj", 1, "ses_a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = registry.save(planning("proj", 1, "ses_b")).unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_accessed_at > first.last_accessed_at);
        let stored = registry.get(&first.key()).unwrap();
        assert_eq!(stored.session_id, "ses_b");
        assert_eq!(stored.created_at, first.created_at);
    }

    #[test]
    fn planning_without_worktree_is_rejected() {
        let (registry, _dir) = temp_registry();
        let key = MappingKey::new("proj", 1, SessionKind::Planning);
        let err = registry.save(SessionMapping::new(&key, "ses")).unwrap_err();
        assert!(matches!(err, RegistryError::MissingWorktree { .. }));

        let discussion = MappingKey::new("proj", 1, SessionKind::Discussion);
        assert!(registry.save(SessionMapping::new(&discussion, "ses")).is_ok());
    }

    #[test]
    fn touch_and_remove_report_existence() {
        let (registry, _dir) = temp_registry();
        let mapping = registry.save(planning("proj", 2, "ses")).unwrap();
        let key = mapping.key();

        assert!(registry.touch(&key).unwrap());
        assert!(registry.remove(&key).unwrap());
        assert!(!registry.remove(&key).unwrap());
        assert!(!registry.touch(&key).unwrap());
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn mark_completed_sets_status() {
        let (registry, _dir) = temp_registry();
        let key = MappingKey::new("proj", 3, SessionKind::Swarm);
        registry
            .save(SessionMapping::new(&key, "ses").with_worktree("/wt").with_epic("bd-1"))
            .unwrap();
        assert!(registry.mark_completed(&key).unwrap());
        assert_eq!(registry.get(&key).unwrap().status, MappingStatus::Completed);
        assert_eq!(registry.find_by_session("ses").unwrap().epic_id.as_deref(), Some("bd-1"));
    }

    #[test]
    fn corrupt_store_reads_empty() {
        let (registry, dir) = temp_registry();
        std::fs::write(dir.path().join("sessions.json"), "[1, 2").unwrap();
        assert!(registry.snapshot().is_empty());
        registry.save(planning("proj", 4, "ses")).unwrap();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn concurrent_saves_of_distinct_keys_both_survive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(dir.path().join("sessions.json")));

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.save(planning("proj", i, &format!("ses_{i}"))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8u64 {
            let key = MappingKey::new("proj", i, SessionKind::Planning);
            assert_eq!(registry.get(&key).unwrap().session_id, format!("ses_{i}"));
        }
    }
}
