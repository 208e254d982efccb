//! Durable entitlement storage.
//!
//! The backing store is a plain string key-value surface (the storefront
//! used browser local storage); [`EntitlementStore`] keeps that shape so
//! backends stay trivially swappable. [`ProductStore`] layers the typed
//! view on top: record and cooldown-marker codecs plus alias-aware lookup.
//!
//! Store semantics the rest of the engine relies on:
//! - deletes are idempotent,
//! - writes are last-write-wins with no queuing,
//! - unreadable values are treated as absent (and logged), never as fatal.

mod json_file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use crate::keys::KeyCodec;
use crate::record::EntitlementRecord;

/// Storage failures. Readers treat corrupt values as absent; this error
/// covers I/O and serialization of outgoing writes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Raw per-key string storage.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn load(&self, storage_key: &str) -> Result<Option<String>, StoreError>;

    async fn save(&self, storage_key: &str, value: &str) -> Result<(), StoreError>;

    /// Idempotent delete; reports whether the key existed.
    async fn delete(&self, storage_key: &str) -> Result<bool, StoreError>;

    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Typed view over an [`EntitlementStore`]: encodes storage keys through
/// the [`KeyCodec`] and (de)serializes records and cooldown markers.
#[derive(Clone)]
pub struct ProductStore {
    inner: Arc<dyn EntitlementStore>,
    codec: KeyCodec,
}

impl ProductStore {
    pub fn new(inner: Arc<dyn EntitlementStore>, codec: KeyCodec) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Load the record stored under `product_key`. A value that fails to
    /// parse is logged and reported as absent so a single corrupt entry
    /// cannot wedge the every-second tick.
    pub async fn load_record(
        &self,
        product_key: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError> {
        let storage_key = self.codec.entitlement_key(product_key);
        let raw = match self.inner.load(&storage_key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<EntitlementRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(product_key = %product_key, error = %err, "unreadable entitlement record treated as absent");
                Ok(None)
            }
        }
    }

    /// First record found across an alias set, with the alias it was
    /// stored under (legacy data may be filed under a non-canonical key).
    pub async fn find_record(
        &self,
        alias_keys: &[String],
    ) -> Result<Option<(String, EntitlementRecord)>, StoreError> {
        for key in alias_keys {
            if let Some(record) = self.load_record(key).await? {
                return Ok(Some((key.clone(), record)));
            }
        }
        Ok(None)
    }

    pub async fn save_record(
        &self,
        product_key: &str,
        record: &EntitlementRecord,
    ) -> Result<(), StoreError> {
        let storage_key = self.codec.entitlement_key(product_key);
        let raw = serde_json::to_string(record)?;
        self.inner.save(&storage_key, &raw).await
    }

    pub async fn delete_record(&self, product_key: &str) -> Result<bool, StoreError> {
        let storage_key = self.codec.entitlement_key(product_key);
        self.inner.delete(&storage_key).await
    }

    /// Cooldown marker: epoch-ms rendered as a decimal string, matching
    /// the storefront's persisted format. Unparsable markers read as
    /// absent.
    pub async fn load_cooldown(&self, product_key: &str) -> Result<Option<i64>, StoreError> {
        let storage_key = self.codec.cooldown_key(product_key);
        let raw = match self.inner.load(&storage_key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match raw.trim().parse::<i64>() {
            Ok(ts) => Ok(Some(ts)),
            Err(_) => {
                tracing::warn!(product_key = %product_key, raw = %raw, "unreadable cooldown marker treated as absent");
                Ok(None)
            }
        }
    }

    pub async fn save_cooldown(&self, product_key: &str, ts_ms: i64) -> Result<(), StoreError> {
        let storage_key = self.codec.cooldown_key(product_key);
        self.inner.save(&storage_key, &ts_ms.to_string()).await
    }

    pub async fn delete_cooldown(&self, product_key: &str) -> Result<bool, StoreError> {
        let storage_key = self.codec.cooldown_key(product_key);
        self.inner.delete(&storage_key).await
    }

    /// Product keys with a stored entitlement record, sorted.
    pub async fn product_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .inner
            .list_keys()
            .await?
            .iter()
            .filter_map(|storage_key| self.codec.product_key_of(storage_key))
            .map(|key| key.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ProductStore {
        ProductStore::new(Arc::new(MemoryStore::new()), KeyCodec::default())
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let store = store();
        assert!(store.load_record("bundle").await.unwrap().is_none());

        let record = EntitlementRecord::new(1_700_000_000_000);
        store.save_record("bundle", &record).await.unwrap();

        let loaded = store.load_record("bundle").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        assert!(store.delete_record("bundle").await.unwrap());
        assert!(!store.delete_record("bundle").await.unwrap());
        assert!(store.load_record("bundle").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_marker_is_epoch_ms_string() {
        let store = store();
        store.save_cooldown("bundle", 1_700_000_000_123).await.unwrap();

        // Raw value is the decimal string the storefront wrote.
        let raw = store
            .inner
            .load("cooldown:bundle")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, "1700000000123");

        assert_eq!(
            store.load_cooldown("bundle").await.unwrap(),
            Some(1_700_000_000_123)
        );
        assert!(store.delete_cooldown("bundle").await.unwrap());
        assert_eq!(store.load_cooldown("bundle").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let store = store();
        store
            .inner
            .save("entitlement:bundle", "{not json")
            .await
            .unwrap();
        assert!(store.load_record("bundle").await.unwrap().is_none());

        store.inner.save("cooldown:bundle", "soon").await.unwrap();
        assert_eq!(store.load_cooldown("bundle").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_record_scans_aliases_in_order() {
        let store = store();
        let record = EntitlementRecord::new(42);
        store.save_record("prod_123", &record).await.unwrap();

        let aliases = vec![
            "bundle".to_string(),
            "prod_123".to_string(),
            "pp_A7".to_string(),
        ];
        let (found_under, found) = store.find_record(&aliases).await.unwrap().unwrap();
        assert_eq!(found_under, "prod_123");
        assert_eq!(found, record);

        assert!(store
            .find_record(&["nope".to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_product_keys_lists_only_entitlements() {
        let store = store();
        store
            .save_record("b-product", &EntitlementRecord::new(1))
            .await
            .unwrap();
        store
            .save_record("a-product", &EntitlementRecord::new(2))
            .await
            .unwrap();
        store.save_cooldown("a-product", 3).await.unwrap();

        assert_eq!(
            store.product_keys().await.unwrap(),
            vec!["a-product".to_string(), "b-product".to_string()]
        );
    }
}
