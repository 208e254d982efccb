//! The entitlement engine service object.
//!
//! [`EntitlementEngine`] is the single entry point the storefront and the
//! CLI talk to. It is constructed once with injected dependencies (store,
//! authority, broadcast, alias resolver, clock) so tests swap in the
//! in-memory fakes; nothing here reaches for a global.
//!
//! The guarded download path is the one place all the gates line up:
//! validation, eligibility, cooldown, the per-key in-flight flag, the
//! authority call under a deadline, and the monotonic reconciliation of
//! the local record against the server-reported remaining count. Every
//! failure leg leaves local state exactly as it was.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::authority::{
    request_grant_with_timeout, DownloadAuthority, DownloadGrant, NullRemote, RemoteEntitlements,
};
use crate::broadcast::{ResetBroadcast, ResetNotice};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineParams;
use crate::eligibility::{
    check_cooldown_with, evaluate_with, CooldownVerdict, EligibilitySnapshot, EligibilityState,
};
use crate::error::TollgateError;
use crate::keys::{validate_product_key, AliasResolver, StaticAliasResolver};
use crate::record::EntitlementRecord;
use crate::reset::{MemoryOwnedProducts, OwnedProductsCache, ResetCoordinator, ResetReport};
use crate::scheduler::{CountdownScheduler, TargetRegistry};
use crate::store::ProductStore;

/// Default deadline for authority calls when the caller supplies none.
pub const DEFAULT_AUTHORITY_TIMEOUT: Duration = Duration::from_secs(10);

/// One product's evaluated state, as reported by [`EntitlementEngine::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatus {
    /// Canonical key the entitlement is filed under.
    pub product_key: String,
    pub record: Option<EntitlementRecord>,
    pub snapshot: EligibilitySnapshot,
    pub cooldown: CooldownVerdict,
}

/// Builder for [`EntitlementEngine`]; store and authority are required,
/// everything else has a production default.
pub struct EngineBuilder {
    store: ProductStore,
    authority: Arc<dyn DownloadAuthority>,
    remote: Arc<dyn RemoteEntitlements>,
    owned: Arc<dyn OwnedProductsCache>,
    broadcast: Arc<ResetBroadcast>,
    resolver: Arc<dyn AliasResolver>,
    clock: Arc<dyn Clock>,
    registry: TargetRegistry,
    params: EngineParams,
    authority_timeout: Duration,
}

impl EngineBuilder {
    pub fn new(store: ProductStore, authority: Arc<dyn DownloadAuthority>) -> Self {
        Self {
            store,
            authority,
            remote: Arc::new(NullRemote),
            owned: Arc::new(MemoryOwnedProducts::new()),
            broadcast: Arc::new(ResetBroadcast::new(None)),
            resolver: Arc::new(StaticAliasResolver::default()),
            clock: Arc::new(SystemClock),
            registry: TargetRegistry::new(),
            params: EngineParams::default(),
            authority_timeout: DEFAULT_AUTHORITY_TIMEOUT,
        }
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteEntitlements>) -> Self {
        self.remote = remote;
        self
    }

    pub fn owned_products(mut self, owned: Arc<dyn OwnedProductsCache>) -> Self {
        self.owned = owned;
        self
    }

    pub fn broadcast(mut self, broadcast: Arc<ResetBroadcast>) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AliasResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(mut self, registry: TargetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn params(mut self, params: EngineParams) -> Self {
        self.params = params;
        self
    }

    pub fn authority_timeout(mut self, timeout: Duration) -> Self {
        self.authority_timeout = timeout;
        self
    }

    /// Must run inside a tokio runtime: the engine spawns a task that
    /// applies reset notices from other engine instances immediately.
    pub fn build(self) -> Arc<EntitlementEngine> {
        let scheduler = Arc::new(CountdownScheduler::new(
            self.store.clone(),
            self.resolver.clone(),
            self.clock.clone(),
            self.registry,
            self.params,
        ));
        let reset = ResetCoordinator::new(
            self.store.clone(),
            self.remote,
            self.owned.clone(),
            self.broadcast.clone(),
            scheduler.clone(),
            self.resolver.clone(),
            self.clock.clone(),
        );

        let engine = Arc::new(EntitlementEngine {
            store: self.store,
            authority: self.authority,
            scheduler,
            reset,
            broadcast: self.broadcast,
            owned: self.owned,
            resolver: self.resolver,
            clock: self.clock,
            params: self.params,
            authority_timeout: self.authority_timeout,
            pending: Mutex::new(HashSet::new()),
            applied_reset_ts: AtomicI64::new(0),
        });

        engine.clone().spawn_reset_listener();
        engine
    }
}

pub struct EntitlementEngine {
    store: ProductStore,
    authority: Arc<dyn DownloadAuthority>,
    scheduler: Arc<CountdownScheduler>,
    reset: ResetCoordinator,
    broadcast: Arc<ResetBroadcast>,
    owned: Arc<dyn OwnedProductsCache>,
    resolver: Arc<dyn AliasResolver>,
    clock: Arc<dyn Clock>,
    params: EngineParams,
    authority_timeout: Duration,
    /// Keys with a grant request in flight. A flag, not a lock: a second
    /// trigger is refused immediately instead of queued.
    pending: Mutex<HashSet<String>>,
    /// Timestamp of the newest reset notice already applied. The persisted
    /// marker outlives its delivery by minutes; this keeps re-reads from
    /// replaying it against state newer than the reset.
    applied_reset_ts: AtomicI64,
}

impl EntitlementEngine {
    pub fn builder(store: ProductStore, authority: Arc<dyn DownloadAuthority>) -> EngineBuilder {
        EngineBuilder::new(store, authority)
    }

    pub fn registry(&self) -> &TargetRegistry {
        self.scheduler.registry()
    }

    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    /// Record a confirmed purchase. Idempotent against double confirmation:
    /// an existing record (under any alias) is kept as-is because the
    /// purchase timestamp is immutable until a reset.
    pub async fn register_purchase(
        &self,
        product_key: &str,
    ) -> Result<EntitlementRecord, TollgateError> {
        let alias_set = self.validated_aliases(product_key)?;

        if let Some((found_under, existing)) = self.store.find_record(&alias_set.keys).await? {
            tracing::debug!(
                product_key = %alias_set.canonical,
                found_under = %found_under,
                "purchase already registered, keeping existing record"
            );
            self.owned.insert(&alias_set.canonical).await;
            return Ok(existing);
        }

        let record = EntitlementRecord::new(self.clock.now_ms());
        self.store
            .save_record(&alias_set.canonical, &record)
            .await?;
        self.owned.insert(&alias_set.canonical).await;
        tracing::info!(product_key = %alias_set.canonical, "purchase registered");
        Ok(record)
    }

    /// One-shot evaluation: the current record, its classified snapshot,
    /// and the cooldown verdict.
    pub async fn status(&self, product_key: &str) -> Result<ProductStatus, TollgateError> {
        let alias_set = self.validated_aliases(product_key)?;
        self.catch_up().await;

        let now = self.clock.now_ms();
        let record = self
            .store
            .find_record(&alias_set.keys)
            .await?
            .map(|(_, record)| record);
        let snapshot = evaluate_with(
            self.params.window_ms,
            self.params.max_downloads,
            record.as_ref(),
            now,
        );
        let cooldown = self.cooldown_for(&alias_set.keys, record.as_ref(), now).await;

        Ok(ProductStatus {
            product_key: alias_set.canonical,
            record,
            snapshot,
            cooldown,
        })
    }

    /// The full guarded download path. On success the local record is
    /// reconciled against the server-reported remaining count; on any
    /// failure nothing local changes.
    pub async fn request_download(
        &self,
        product_key: &str,
        timeout: Option<Duration>,
    ) -> Result<DownloadGrant, TollgateError> {
        let alias_set = self.validated_aliases(product_key)?;
        let canonical = alias_set.canonical.clone();

        // Per-key in-flight flag; a double click must not reach the
        // authority twice.
        {
            let mut pending = self.pending.lock().await;
            if !pending.insert(canonical.clone()) {
                return Err(TollgateError::GrantInFlight {
                    product_key: canonical,
                });
            }
        }

        let result = self
            .guarded_download(&canonical, &alias_set.keys, timeout)
            .await;

        self.pending.lock().await.remove(&canonical);
        result
    }

    async fn guarded_download(
        &self,
        canonical: &str,
        alias_keys: &[String],
        timeout: Option<Duration>,
    ) -> Result<DownloadGrant, TollgateError> {
        let now = self.clock.now_ms();
        let found = self.store.find_record(alias_keys).await?;
        let (found_under, record) = match found {
            Some(found) => found,
            None => {
                return Err(TollgateError::NoEntitlement {
                    product_key: canonical.to_string(),
                })
            }
        };

        let snapshot = evaluate_with(
            self.params.window_ms,
            self.params.max_downloads,
            Some(&record),
            now,
        );
        match snapshot.state {
            EligibilityState::Expired => {
                return Err(TollgateError::Expired {
                    product_key: canonical.to_string(),
                })
            }
            EligibilityState::LimitReached => {
                return Err(TollgateError::LimitReached {
                    product_key: canonical.to_string(),
                })
            }
            EligibilityState::Active | EligibilityState::NoEntitlement => {}
        }

        let cooldown = self.cooldown_for(alias_keys, Some(&record), now).await;
        if !cooldown.allowed {
            return Err(TollgateError::CooldownActive {
                seconds_left: cooldown.seconds_left,
            });
        }

        let deadline = timeout.unwrap_or(self.authority_timeout);
        let grant =
            request_grant_with_timeout(self.authority.as_ref(), canonical, deadline).await?;

        // Reconcile and persist. The grant happened server-side either
        // way, so a failed write here is logged and healed by the max()
        // reconciliation on the next successful grant.
        let granted_at = self.clock.now_ms();
        let mut updated = record;
        updated.apply_grant(grant.remaining_downloads, granted_at);
        if let Err(err) = self.store.save_record(&found_under, &updated).await {
            tracing::warn!(product_key = %canonical, error = %err, "grant succeeded but local record write failed");
        }
        if let Err(err) = self.store.save_cooldown(&found_under, granted_at).await {
            tracing::warn!(product_key = %canonical, error = %err, "grant succeeded but cooldown marker write failed");
        }

        tracing::info!(
            product_key = %canonical,
            remaining_downloads = grant.remaining_downloads,
            "download granted"
        );
        Ok(grant)
    }

    /// Start the countdown publication loop for the key.
    pub async fn start_countdown(&self, product_key: &str) -> Result<(), TollgateError> {
        let alias_set = self.validated_aliases(product_key)?;
        self.scheduler.start(&alias_set.canonical).await;
        Ok(())
    }

    /// Stop the countdown loop for the key, if one runs.
    pub async fn stop_countdown(&self, product_key: &str) -> Result<(), TollgateError> {
        let alias_set = self.validated_aliases(product_key)?;
        self.scheduler.stop(&alias_set.canonical).await;
        Ok(())
    }

    pub async fn countdown_running(&self, product_key: &str) -> bool {
        self.scheduler.is_running(product_key).await
    }

    /// Admin reset across the alias set, every store, and the broadcast.
    pub async fn reset(
        &self,
        product_key: &str,
        skip_remote: bool,
    ) -> Result<ResetReport, TollgateError> {
        self.validated_aliases(product_key)?;
        Ok(self.reset.reset(product_key, skip_remote).await)
    }

    /// Every locally stored entitlement with its evaluated state.
    pub async fn list(&self) -> Result<Vec<ProductStatus>, TollgateError> {
        self.catch_up().await;
        let mut statuses = Vec::new();
        for key in self.store.product_keys().await? {
            let now = self.clock.now_ms();
            let record = self.store.load_record(&key).await?;
            let snapshot = evaluate_with(
                self.params.window_ms,
                self.params.max_downloads,
                record.as_ref(),
                now,
            );
            let cooldown = self
                .cooldown_for(std::slice::from_ref(&key), record.as_ref(), now)
                .await;
            statuses.push(ProductStatus {
                product_key: key,
                record,
                snapshot,
                cooldown,
            });
        }
        Ok(statuses)
    }

    pub async fn owned_products(&self) -> Vec<String> {
        self.owned.list().await
    }

    /// Apply a persisted reset marker this process missed. Safe to call on
    /// every read: a stale or absent marker is a no-op, and a marker that
    /// was already applied (here or through the live listener) is skipped
    /// so it cannot invalidate a purchase made after the reset.
    pub async fn catch_up(&self) {
        let notice = match self.broadcast.catch_up(self.clock.now_ms()).await {
            Some(notice) => notice,
            None => return,
        };
        if self.applied_reset_ts.fetch_max(notice.ts, Ordering::SeqCst) >= notice.ts {
            return;
        }
        tracing::info!(product_key = %notice.product_key, "applying missed reset notice");
        self.apply_notice(&notice).await;
    }

    fn spawn_reset_listener(self: Arc<Self>) {
        let mut rx = self.broadcast.subscribe();
        let engine = Arc::downgrade(&self);
        tokio::spawn(async move {
            loop {
                let notice = match rx.recv().await {
                    Ok(notice) => notice,
                    // Missed notices are covered by the persisted marker.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let engine = match engine.upgrade() {
                    Some(engine) => engine,
                    None => break,
                };
                engine
                    .applied_reset_ts
                    .fetch_max(notice.ts, Ordering::SeqCst);
                engine.apply_notice(&notice).await;
            }
        });
    }

    /// Immediate convergence on a reset notice: stop countdowns and drop
    /// ownership for every noticed key. Record deletion already happened
    /// in the resetting instance through the shared store. A key whose
    /// record postdates the notice was re-purchased after the reset and
    /// is left alone.
    async fn apply_notice(&self, notice: &ResetNotice) {
        for key in &notice.keys {
            match self.store.load_record(key).await {
                Ok(Some(record)) if record.purchase_timestamp > notice.ts => {
                    tracing::debug!(key = %key, "record newer than reset notice, keeping it");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "record read failed while applying reset notice");
                }
            }
            self.scheduler.stop(key).await;
            self.owned.remove(key).await;
        }
    }

    fn validated_aliases(&self, product_key: &str) -> Result<crate::keys::AliasSet, TollgateError> {
        validate_product_key(product_key).map_err(TollgateError::Validation)?;
        Ok(self.resolver.resolve(product_key))
    }

    /// Cooldown from the record's timestamp, falling back to the persisted
    /// marker for legacy records that never carried one.
    async fn cooldown_for(
        &self,
        alias_keys: &[String],
        record: Option<&EntitlementRecord>,
        now: i64,
    ) -> CooldownVerdict {
        let mut last = record.and_then(|r| r.last_download_timestamp);
        if last.is_none() {
            for key in alias_keys {
                match self.store.load_cooldown(key).await {
                    Ok(Some(marker)) => {
                        last = Some(marker);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "cooldown marker read failed")
                    }
                }
            }
        }
        check_cooldown_with(self.params.cooldown_ms, last, now)
    }
}

impl std::fmt::Debug for EntitlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementEngine")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
