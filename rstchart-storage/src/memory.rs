//! In-memory checkpoint store.

use dashmap::DashMap;
use rstchart_core::{CheckpointStore, StoreError};

/// Keeps checkpoints in a concurrent map. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_remove() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("s1").unwrap().is_none());

        store.save("s1", b"one").unwrap();
        store.save("s1", b"two").unwrap();
        store.save("s0", b"zero").unwrap();

        assert_eq!(store.load("s1").unwrap().unwrap(), b"two");
        assert_eq!(store.keys().unwrap(), vec!["s0", "s1"]);

        store.remove("s1").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.len(), 1);
    }
}
