//! Durable file-backed KV store with crash-consistent snapshots.
//!
//! The whole map is serialized to one JSON snapshot file. Every durable write
//! goes through write-temp + fsync + atomic rename, so a crash at any point
//! leaves either the previous snapshot or the new one on disk, never a mix.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{KvStore, WriteOp};
use crate::{Error, Result};

/// Durable key-value store persisting to a single snapshot file.
///
/// Suited to the small, replace-wholesale working set of an enrollment
/// database (one catalog, one pending catalog, a handful of records); not a
/// general-purpose database.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FileKvStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    /// * [`Error::Io`] when the file exists but cannot be read
    /// * [`Error::InvalidPersistedData`] when the snapshot cannot be decoded
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidPersistedData(e.to_string()))?
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), "opened enrollment database");
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    /// Serialize `map` and atomically replace the snapshot file.
    fn persist(&self, map: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(map)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.map.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.map.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read_map().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.commit(vec![WriteOp::put(key, value)])
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.commit(vec![WriteOp::delete(key)])
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .read_map()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut guard = self.write_map();

        // Stage the batch on a copy so a failed persist leaves the in-memory
        // view matching the on-disk snapshot.
        let mut staged = guard.clone();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    staged.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    staged.remove(&key);
                }
            }
        }
        self.persist(&staged)?;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enrollments.db");
        (dir, path)
    }

    #[test]
    fn test_file_kv_round_trip_across_reopen() {
        let (_dir, path) = scratch();
        {
            let store = FileKvStore::open(&path).unwrap();
            store.put("key", b"value".to_vec()).unwrap();
        }
        let store = FileKvStore::open(&path).unwrap();
        assert_eq!(store.get("key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_file_kv_commit_is_all_or_nothing_across_reopen() {
        let (_dir, path) = scratch();
        {
            let store = FileKvStore::open(&path).unwrap();
            store
                .commit(vec![
                    WriteOp::put("a", b"1".to_vec()),
                    WriteOp::put("b", b"2".to_vec()),
                ])
                .unwrap();
        }
        let store = FileKvStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_file_kv_corrupt_snapshot_is_invalid_persisted_data() {
        let (_dir, path) = scratch();
        fs::write(&path, b"not json at all").unwrap();
        let err = FileKvStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidPersistedData(_)));
    }

    #[test]
    fn test_file_kv_missing_file_starts_empty() {
        let (_dir, path) = scratch();
        let store = FileKvStore::open(&path).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
    }

    #[test]
    fn test_file_kv_delete_persists() {
        let (_dir, path) = scratch();
        {
            let store = FileKvStore::open(&path).unwrap();
            store.put("key", b"value".to_vec()).unwrap();
            store.delete("key").unwrap();
        }
        let store = FileKvStore::open(&path).unwrap();
        assert_eq!(store.get("key").unwrap(), None);
    }
}
