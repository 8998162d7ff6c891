//! `KvStore` trait and implementations.
//!
//! Keys are slash-separated paths (`task/<uuid>`, `checkpoint/<uuid>`);
//! values are raw JSON documents. The store does not interpret either.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

/// Errors that can occur in the key/value store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Trait for key/value storage backends.
pub trait KvStore: Send + Sync {
    /// Reads the value at `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes `value` at `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deletes the value at `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Lists all keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryKv {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().expect("kv lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().expect("kv lock poisoned");
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().expect("kv lock poisoned");
        entries.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().expect("kv lock poisoned");
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory-backed store: one file per key under a root directory.
///
/// Writes go through a temp file + rename so a crash mid-write never leaves
/// a torn value behind.
pub struct DirKv {
    root: PathBuf,
}

impl DirKv {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.split('/').any(|seg| {
                seg.is_empty() || seg == "." || seg == ".." || seg.contains(std::path::MAIN_SEPARATOR)
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KvStore for DirKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Some(rel) = path.strip_prefix(&self.root).ok().and_then(|p| p.to_str())
                else {
                    continue;
                };
                let Some(key) = rel.strip_suffix(".json") else {
                    continue;
                };

                let key = key.replace(std::path::MAIN_SEPARATOR, "/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }

        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn KvStore) {
        assert_eq!(store.get("task/a").unwrap(), None);

        store.put("task/a", b"{\"x\":1}").unwrap();
        store.put("task/b", b"{\"x\":2}").unwrap();
        store.put("checkpoint/a", b"[]").unwrap();

        assert_eq!(store.get("task/a").unwrap(), Some(b"{\"x\":1}".to_vec()));
        assert_eq!(
            store.keys("task/").unwrap(),
            vec!["task/a".to_string(), "task/b".to_string()]
        );

        store.delete("task/a").unwrap();
        assert_eq!(store.get("task/a").unwrap(), None);
        // Deleting twice is fine.
        store.delete("task/a").unwrap();
    }

    #[test]
    fn in_memory_store() {
        exercise_store(&InMemoryKv::new());
    }

    #[test]
    fn dir_store() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirKv::open(tmp.path().join("kv")).expect("open");
        exercise_store(&store);
    }

    #[test]
    fn dir_store_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("kv");

        {
            let store = DirKv::open(root.clone()).expect("open");
            store.put("task/persisted", b"{}").unwrap();
        }

        let store = DirKv::open(root).expect("reopen");
        assert_eq!(store.get("task/persisted").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn dir_store_rejects_traversal_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DirKv::open(tmp.path().join("kv")).expect("open");
        assert!(store.put("../escape", b"{}").is_err());
        assert!(store.put("", b"{}").is_err());
    }
}
