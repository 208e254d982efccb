//! Admin-triggered entitlement reset.
//!
//! A reset invalidates a purchase everywhere it is tracked: the running
//! countdown, the local record and cooldown marker for every alias, the
//! authoritative remote store, the owned-products working set, and other
//! processes via the reset broadcast. Every leg is best-effort and
//! independently fault-tolerant; the user-visible, safety-relevant part
//! (local invalidation + broadcast) always completes, and remote failures
//! are reported in the [`ResetReport`] rather than aborting.
//!
//! Resets are idempotent: re-running one turns every delete into a no-op
//! and still succeeds.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::authority::RemoteEntitlements;
use crate::broadcast::{ResetBroadcast, ResetNotice};
use crate::clock::Clock;
use crate::error::TollgateError;
use crate::keys::AliasResolver;
use crate::scheduler::CountdownScheduler;
use crate::store::ProductStore;

/// Secondary local working set answering "what do I own". Kept separate
/// from the entitlement store; a reset removes the key here too so stale
/// ownership cannot resurrect a cleared entitlement in the UI.
#[async_trait]
pub trait OwnedProductsCache: Send + Sync {
    async fn contains(&self, product_key: &str) -> bool;
    async fn insert(&self, product_key: &str);
    /// Idempotent; reports whether the key was present.
    async fn remove(&self, product_key: &str) -> bool;
    /// Sorted list of owned keys.
    async fn list(&self) -> Vec<String>;
}

/// In-process owned-products set for tests and the demo mode.
#[derive(Debug, Default)]
pub struct MemoryOwnedProducts {
    keys: tokio::sync::RwLock<BTreeSet<String>>,
}

impl MemoryOwnedProducts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OwnedProductsCache for MemoryOwnedProducts {
    async fn contains(&self, product_key: &str) -> bool {
        self.keys.read().await.contains(product_key)
    }

    async fn insert(&self, product_key: &str) {
        self.keys.write().await.insert(product_key.to_string());
    }

    async fn remove(&self, product_key: &str) -> bool {
        self.keys.write().await.remove(product_key)
    }

    async fn list(&self) -> Vec<String> {
        self.keys.read().await.iter().cloned().collect()
    }
}

/// Owned-products set persisted as a JSON array in one file.
///
/// The whole set rewrites on every change; ownership sets are tiny (one
/// entry per purchase) so that stays cheap. Read failures degrade to an
/// empty set, matching the store's corrupt-reads-as-absent policy.
#[derive(Debug, Clone)]
pub struct JsonFileOwnedProducts {
    path: PathBuf,
}

impl JsonFileOwnedProducts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_set(&self) -> BTreeSet<String> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return BTreeSet::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "unreadable owned-products cache treated as empty");
                BTreeSet::new()
            }
        }
    }

    async fn write_set(&self, keys: &BTreeSet<String>) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %err, "could not create owned-products directory");
                return;
            }
        }
        match serde_json::to_vec(keys) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&self.path, bytes).await {
                    tracing::warn!(error = %err, path = %self.path.display(), "could not persist owned-products cache");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not serialize owned-products cache");
            }
        }
    }
}

#[async_trait]
impl OwnedProductsCache for JsonFileOwnedProducts {
    async fn contains(&self, product_key: &str) -> bool {
        self.read_set().await.contains(product_key)
    }

    async fn insert(&self, product_key: &str) {
        let mut keys = self.read_set().await;
        if keys.insert(product_key.to_string()) {
            self.write_set(&keys).await;
        }
    }

    async fn remove(&self, product_key: &str) -> bool {
        let mut keys = self.read_set().await;
        let removed = keys.remove(product_key);
        if removed {
            self.write_set(&keys).await;
        }
        removed
    }

    async fn list(&self) -> Vec<String> {
        self.read_set().await.into_iter().collect()
    }
}

/// One failed remote delete within a reset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Structured outcome of one reset, serializable for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    /// Unique id tying log lines of one reset together.
    pub id: String,
    /// The key the admin asked to reset.
    pub product_key: String,
    /// Full alias set the reset acted on.
    pub keys: Vec<String>,
    /// Local entries (records + cooldown markers) that actually existed
    /// and were deleted. Zero on a re-run of an earlier reset.
    pub local_deleted: usize,
    /// Remote aliases attempted; empty when the remote leg was skipped.
    pub remote_attempted: usize,
    /// Remote deletes that failed. Local invalidation completed anyway.
    pub remote_failures: Vec<RemoteFailure>,
    /// Epoch ms the reset was performed.
    pub ts: i64,
}

impl ResetReport {
    /// True when every attempted remote delete succeeded.
    pub fn remote_clean(&self) -> bool {
        self.remote_failures.is_empty()
    }

    /// The report as an error form for callers that want one.
    pub fn into_result(self) -> Result<ResetReport, TollgateError> {
        if self.remote_clean() {
            Ok(self)
        } else {
            Err(TollgateError::PartialReset {
                failed: self.remote_failures.len(),
                attempted: self.remote_attempted,
            })
        }
    }
}

/// Carries a reset across every place entitlement state lives.
pub struct ResetCoordinator {
    store: ProductStore,
    remote: Arc<dyn RemoteEntitlements>,
    owned: Arc<dyn OwnedProductsCache>,
    broadcast: Arc<ResetBroadcast>,
    scheduler: Arc<CountdownScheduler>,
    resolver: Arc<dyn AliasResolver>,
    clock: Arc<dyn Clock>,
}

impl ResetCoordinator {
    pub fn new(
        store: ProductStore,
        remote: Arc<dyn RemoteEntitlements>,
        owned: Arc<dyn OwnedProductsCache>,
        broadcast: Arc<ResetBroadcast>,
        scheduler: Arc<CountdownScheduler>,
        resolver: Arc<dyn AliasResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            remote,
            owned,
            broadcast,
            scheduler,
            resolver,
            clock,
        }
    }

    /// Reset the entitlement for `product_key` and every alias.
    /// `skip_remote` leaves the authoritative store untouched (offline
    /// admin work); the local side clears regardless.
    pub async fn reset(&self, product_key: &str, skip_remote: bool) -> ResetReport {
        let alias_set = self.resolver.resolve(product_key);
        let id = uuid::Uuid::new_v4().to_string();
        let ts = self.clock.now_ms();

        tracing::info!(
            reset_id = %id,
            product_key = %product_key,
            aliases = alias_set.keys.len(),
            "entitlement reset started"
        );

        // Stop the countdown first so no tick publishes a stale snapshot
        // mid-reset. One stop covers the whole alias set.
        self.scheduler.stop(&alias_set.canonical).await;

        // Local invalidation, per alias. A store failure on one entry
        // must not strand the others, so each delete is its own attempt.
        let mut local_deleted = 0;
        for key in &alias_set.keys {
            match self.store.delete_record(key).await {
                Ok(existed) => local_deleted += existed as usize,
                Err(err) => {
                    tracing::warn!(reset_id = %id, key = %key, error = %err, "local record delete failed")
                }
            }
            match self.store.delete_cooldown(key).await {
                Ok(existed) => local_deleted += existed as usize,
                Err(err) => {
                    tracing::warn!(reset_id = %id, key = %key, error = %err, "cooldown marker delete failed")
                }
            }
        }

        // Authoritative remote deletes, one per alias, never aborting on
        // individual failures.
        let mut remote_attempted = 0;
        let mut remote_failures = Vec::new();
        if !skip_remote {
            for key in &alias_set.keys {
                remote_attempted += 1;
                if let Err(err) = self.remote.delete_entitlement(key).await {
                    tracing::warn!(
                        reset_id = %id,
                        key = %key,
                        code = %err.code,
                        "remote entitlement delete failed"
                    );
                    remote_failures.push(RemoteFailure {
                        key: key.clone(),
                        code: err.code.as_str().to_string(),
                        message: err.message,
                    });
                }
            }
        }

        // Drop every alias from the ownership working set.
        for key in &alias_set.keys {
            self.owned.remove(key).await;
        }

        // Fan out to live subscribers and persist the catch-up marker.
        self.broadcast
            .publish(ResetNotice {
                product_key: product_key.to_string(),
                keys: alias_set.keys.clone(),
                ts,
            })
            .await;

        let report = ResetReport {
            id,
            product_key: product_key.to_string(),
            keys: alias_set.keys,
            local_deleted,
            remote_attempted,
            remote_failures,
            ts,
        };

        if report.remote_clean() {
            tracing::info!(reset_id = %report.id, local_deleted, "entitlement reset complete");
        } else {
            tracing::warn!(
                reset_id = %report.id,
                failed = report.remote_failures.len(),
                attempted = report.remote_attempted,
                "entitlement reset complete locally, remote partially failed"
            );
        }

        report
    }
}
