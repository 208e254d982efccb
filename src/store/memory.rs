//! In-process store. Backs tests and the scripted demo mode; also the
//! reference implementation of the store contract.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EntitlementStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn load(&self, storage_key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(storage_key).cloned())
    }

    async fn save(&self, storage_key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(storage_key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, storage_key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(storage_key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.load("k").await.unwrap(), None);

        store.save("k", "v1").await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some("v1".to_string()));

        // Last write wins.
        store.save("k", "v2").await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some("v2".to_string()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.save("k", "v").await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.load("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_lists_keys() {
        let store = MemoryStore::new();
        store.save("a", "1").await.unwrap();
        store.save("b", "2").await.unwrap();

        let mut keys = store.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
