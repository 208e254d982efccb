//! Deterministic in-process authority.
//!
//! Tests push scripted responses; the CLI's offline demo mode uses the
//! self-counting variant, which enforces the download cap server-side the
//! way the real authority does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AuthorityError, AuthorityErrorCode, DownloadAuthority, DownloadGrant, RemoteEntitlements,
};
use crate::record::MAX_DOWNLOADS;

#[derive(Default)]
pub struct ScriptedAuthority {
    script: Mutex<VecDeque<Result<DownloadGrant, AuthorityError>>>,
    delay: Mutex<Option<Duration>>,
    grant_calls: AtomicUsize,
    /// Per-key grant counts for demo mode.
    demo_counts: Mutex<Option<HashMap<String, u32>>>,
    deleted: Mutex<Vec<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl ScriptedAuthority {
    /// Authority that only serves scripted responses and fails once the
    /// script runs out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authority that synthesizes grants, counting downloads per key and
    /// refusing with `resource-exhausted` past the cap. Scripted responses,
    /// if pushed, are served first.
    pub fn demo() -> Self {
        Self {
            demo_counts: Mutex::new(Some(HashMap::new())),
            ..Self::default()
        }
    }

    pub async fn push_grant(&self, grant: DownloadGrant) {
        self.script.lock().await.push_back(Ok(grant));
    }

    pub async fn push_failure(&self, code: AuthorityErrorCode, message: &str) {
        self.script
            .lock()
            .await
            .push_back(Err(AuthorityError::new(code, message)));
    }

    /// Delay every grant response; used to exercise timeouts and the
    /// in-flight guard.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    pub fn grant_calls(&self) -> usize {
        self.grant_calls.load(Ordering::SeqCst)
    }

    /// Keys remote-deleted so far, in call order.
    pub async fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    /// Make remote deletes for `product_key` fail with `unavailable`.
    pub async fn fail_deletes_for(&self, product_key: &str) {
        self.failing_deletes
            .lock()
            .await
            .insert(product_key.to_string());
    }

    async fn demo_grant(&self, product_key: &str) -> Option<Result<DownloadGrant, AuthorityError>> {
        let mut counts = self.demo_counts.lock().await;
        let counts = counts.as_mut()?;
        let served = counts.entry(product_key.to_string()).or_insert(0);
        if *served >= MAX_DOWNLOADS {
            return Some(Err(AuthorityError::new(
                AuthorityErrorCode::ResourceExhausted,
                format!("download limit reached for {product_key}"),
            )));
        }
        *served += 1;
        Some(Ok(DownloadGrant {
            download_url: format!(
                "https://downloads.example.com/{product_key}?sig={}",
                uuid::Uuid::new_v4()
            ),
            file_name: format!("{product_key}.zip"),
            remaining_downloads: MAX_DOWNLOADS - *served,
            expires_in: 300,
        }))
    }
}

#[async_trait]
impl DownloadAuthority for ScriptedAuthority {
    async fn request_grant(&self, product_key: &str) -> Result<DownloadGrant, AuthorityError> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(scripted) = self.script.lock().await.pop_front() {
            return scripted;
        }
        if let Some(demo) = self.demo_grant(product_key).await {
            return demo;
        }
        Err(AuthorityError::new(
            AuthorityErrorCode::Unknown,
            "scripted authority has no response queued",
        ))
    }
}

#[async_trait]
impl RemoteEntitlements for ScriptedAuthority {
    async fn delete_entitlement(&self, product_key: &str) -> Result<(), AuthorityError> {
        if self.failing_deletes.lock().await.contains(product_key) {
            return Err(AuthorityError::unavailable(format!(
                "remote delete failed for {product_key}"
            )));
        }
        self.deleted.lock().await.push(product_key.to_string());
        Ok(())
    }
}
