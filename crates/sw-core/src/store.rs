use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Schema version written into every store envelope.
pub const CURRENT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// A document that can live in a [`JsonStore`].
///
/// Implementors expose their schema version so that a file written by a
/// newer build is treated as unreadable instead of silently misparsed.
pub trait Versioned: Default + Serialize + DeserializeOwned {
    fn version(&self) -> u32;
}

// ---------------------------------------------------------------------------
// JsonStore
// ---------------------------------------------------------------------------

/// Single-file JSON store mutated by read-modify-atomic-rewrite.
///
/// A missing file loads as `T::default()`. A file that cannot be read or
/// parsed, or that carries an unknown schema version, is logged and also
/// loads as `T::default()`: the stores are caches that must never take the
/// orchestrator down.
///
/// Writes go to a uniquely named temporary file in the same directory and
/// are renamed over the target, so readers only ever see a complete document.
/// Updates from the same process are serialised; concurrent writers in other
/// processes resolve last-writer-wins.
pub struct JsonStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Versioned> JsonStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document.
    pub fn load(&self) -> T {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store unreadable, treating as empty");
                return T::default();
            }
        };

        match serde_json::from_str::<T>(&data) {
            Ok(doc) if doc.version() == CURRENT_VERSION => doc,
            Ok(doc) => {
                warn!(
                    path = %self.path.display(),
                    version = doc.version(),
                    expected = CURRENT_VERSION,
                    "store has unsupported schema version, treating as empty"
                );
                T::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store corrupt, treating as empty");
                T::default()
            }
        }
    }

    /// Load, apply `f`, and persist the result atomically.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut doc = self.load();
        let out = f(&mut doc);
        self.persist(&doc)?;
        Ok(out)
    }

    fn persist(&self, doc: &T) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.json".to_string());
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let json = serde_json::to_vec_pretty(doc)?;
        if let Err(e) = write_synced(&tmp_path, &json) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StoreError::io(&tmp_path, e));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StoreError::io(&self.path, e));
        }
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize)]
    struct Doc {
        version: u32,
        #[serde(default)]
        items: BTreeMap<String, u32>,
    }

    impl Default for Doc {
        fn default() -> Self {
            Self {
                version: CURRENT_VERSION,
                items: BTreeMap::new(),
            }
        }
    }

    impl Versioned for Doc {
        fn version(&self) -> u32 {
            self.version
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::new(dir.path().join("absent.json"));
        assert!(store.load().items.is_empty());
    }

    #[test]
    fn update_creates_parent_dirs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let store: JsonStore<Doc> = JsonStore::new(&path);

        store.update(|d| d.items.insert("a".into(), 1)).unwrap();

        assert!(path.exists());
        assert_eq!(store.load().items.get("a"), Some(&1));
    }

    #[test]
    fn corrupt_file_loads_as_empty_and_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store: JsonStore<Doc> = JsonStore::new(&path);

        assert!(store.load().items.is_empty());
        store.update(|d| d.items.insert("b".into(), 2)).unwrap();
        assert_eq!(store.load().items.len(), 1);
    }

    #[test]
    fn unknown_version_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"version": 99, "items": {"x": 1}}"#).unwrap();
        let store: JsonStore<Doc> = JsonStore::new(&path);
        assert!(store.load().items.is_empty());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Doc> = JsonStore::new(dir.path().join("doc.json"));
        for i in 0..5 {
            store.update(|d| d.items.insert(format!("k{i}"), i)).unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
    }
}
