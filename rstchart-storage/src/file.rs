//! File checkpoint store.
//!
//! One file per session plus an `index.json` holding the size and crc32c of
//! every file, so a torn or edited checkpoint is detected on load.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rstchart_core::{CheckpointStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

/// Metadata stored in the index for each checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub key: String,
    pub file: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint store backed by a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// key -> metadata of the current checkpoint file.
    index: RwLock<HashMap<String, CheckpointMeta>>,
}

impl FileCheckpointStore {
    /// Opens or creates a checkpoint store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            index: RwLock::new(HashMap::new()),
        };
        store.load_index()?;

        tracing::info!(
            "Opened checkpoint store at {} ({} checkpoints)",
            store.dir.display(),
            store.index.read().len()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(());
        }

        let file = File::open(&index_path)?;
        let index: HashMap<String, CheckpointMeta> =
            serde_json::from_reader(BufReader::new(file))?;
        *self.index.write() = index;
        Ok(())
    }

    /// Writes the index through a temporary file and a rename.
    fn save_index(&self) -> Result<(), StorageError> {
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &*self.index.read())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// Writes a checkpoint and records it in the index.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<CheckpointMeta, StorageError> {
        let file = file_name(key);
        let path = self.dir.join(&file);
        let tmp = self.dir.join(format!("{}.tmp", file));

        let mut out = File::create(&tmp)?;
        out.write_all(bytes)?;
        out.sync_all()?;
        fs::rename(&tmp, &path)?;

        let meta = CheckpointMeta {
            key: key.to_string(),
            file,
            size_bytes: bytes.len() as u64,
            checksum: checksum(bytes),
            updated_at: Utc::now(),
        };
        self.index.write().insert(key.to_string(), meta.clone());
        self.save_index()?;

        tracing::debug!("Wrote checkpoint {} ({} bytes)", key, meta.size_bytes);
        Ok(meta)
    }

    /// Reads a checkpoint, verifying its checksum.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(meta) = self.meta(key) else {
            return Ok(None);
        };

        let path = self.dir.join(&meta.file);
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let data = fs::read(&path)?;

        if checksum(&data) != meta.checksum {
            tracing::warn!("Checkpoint {} failed checksum verification", key);
            return Err(StorageError::Corruption(format!(
                "checkpoint {} checksum mismatch",
                key
            )));
        }
        Ok(Some(data))
    }

    /// Deletes a checkpoint. Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.index.write().remove(key);
        if let Some(meta) = removed {
            let path = self.dir.join(&meta.file);
            if path.exists() {
                fs::remove_file(&path)?;
            }
            self.save_index()?;
            tracing::debug!("Deleted checkpoint {}", key);
        }
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Option<CheckpointMeta> {
        self.index.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<CheckpointMeta> {
        let mut all: Vec<CheckpointMeta> = self.index.read().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.put(key, bytes)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(key)?)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.delete(key)?)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.list().into_iter().map(|m| m.key).collect())
    }
}

impl std::fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("dir", &self.dir)
            .field("checkpoints", &self.len())
            .finish()
    }
}

fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32c::crc32c(data))
}

/// File name for a key. Unsafe characters are replaced and the key's crc
/// keeps replaced names apart.
fn file_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{:08x}.ckpt", safe, crc32c::crc32c(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        let meta = store.put("session-1", b"{\"n\":1}").unwrap();
        assert_eq!(meta.size_bytes, 7);
        assert_eq!(store.get("session-1").unwrap().unwrap(), b"{\"n\":1}");
        assert!(store.get("session-2").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        for i in 1..=3 {
            store.put("s", format!("v{}", i).as_bytes()).unwrap();
        }
        assert_eq!(store.get("s").unwrap().unwrap(), b"v3");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).unwrap();
            store.put("a", b"alpha").unwrap();
            store.put("b", b"beta").unwrap();
            store.delete("a").unwrap();
        }

        let store = FileCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b"]);
        assert_eq!(store.load("b").unwrap().unwrap(), b"beta");
        assert!(store.load("a").unwrap().is_none());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        let meta = store.put("s", b"original").unwrap();

        fs::write(dir.path().join(&meta.file), b"tampered").unwrap();

        assert!(matches!(store.get("s"), Err(StorageError::Corruption(_))));
        assert!(matches!(store.load("s"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_missing_file_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        let meta = store.put("s", b"data").unwrap();

        fs::remove_file(dir.path().join(&meta.file)).unwrap();
        assert!(matches!(store.get("s"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        store.delete("nothing").unwrap();
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn prop_distinct_keys_get_distinct_files(a in "[a-z/.:#]{1,12}", b in "[a-z/.:#]{1,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(file_name(&a), file_name(&b));
        }
    }
}
