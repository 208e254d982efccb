//! File-backed store: one file per storage key under a data directory.
//!
//! Storage keys contain `:`, which several filesystems reject, so file
//! names are percent-encoded storage keys. Encoding is reversible, which
//! is what makes `list_keys` possible without a separate index file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{EntitlementStore, StoreError};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, storage_key: &str) -> PathBuf {
        self.root.join(encode_component(storage_key))
    }
}

#[async_trait]
impl EntitlementStore for JsonFileStore {
    async fn load(&self, storage_key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(storage_key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, storage_key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(storage_key), value).await?;
        Ok(())
    }

    async fn delete(&self, storage_key: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(storage_key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match decode_component(&name) {
                Some(key) => keys.push(key),
                None => {
                    tracing::debug!(file = %name, "skipping file with undecodable name");
                }
            }
        }
        Ok(keys)
    }
}

/// Percent-encode everything outside `[A-Za-z0-9._-]`.
fn encode_component(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_component(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = (bytes[i + 1] as char).to_digit(16)?;
            let lo = (bytes[i + 2] as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
