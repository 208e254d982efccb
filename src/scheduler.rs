//! Per-product countdown scheduling.
//!
//! A [`CountdownScheduler`] runs one tick task per tracked product key.
//! Every tick re-reads the entitlement record from the store (never an
//! in-memory copy), classifies it, and publishes the snapshot to every
//! presentation target registered for the key. The task stops itself at a
//! terminal state or when its last target unregisters; convergence across
//! processes comes from each task re-deriving truth from the shared store,
//! not from any lock.
//!
//! Presentation is an observer seam: UI code registers a target through
//! [`TargetRegistry`] and receives snapshots; the engine never inspects UI
//! state. A scheduler started before its first target registered retries
//! discovery a bounded number of times before giving up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::clock::Clock;
use crate::config::EngineParams;
use crate::eligibility::{evaluate_with, EligibilitySnapshot};
use crate::keys::AliasResolver;
use crate::store::ProductStore;

/// Receives eligibility snapshots for one or more product keys.
///
/// Implementations must be cheap and non-blocking; they run inside the
/// every-second tick.
pub trait PresentationTarget: Send + Sync {
    fn publish(&self, product_key: &str, snapshot: &EligibilitySnapshot);
}

/// Handle returned by [`TargetRegistry::register`]; used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

/// Registry of presentation targets, keyed by product key.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<(TargetId, Arc<dyn PresentationTarget>)>>>>,
    next_id: Arc<AtomicU64>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        product_key: &str,
        target: Arc<dyn PresentationTarget>,
    ) -> TargetId {
        let id = TargetId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .write()
            .await
            .entry(product_key.to_string())
            .or_default()
            .push((id, target));
        id
    }

    pub async fn unregister(&self, product_key: &str, id: TargetId) {
        let mut inner = self.inner.write().await;
        if let Some(targets) = inner.get_mut(product_key) {
            targets.retain(|(target_id, _)| *target_id != id);
            if targets.is_empty() {
                inner.remove(product_key);
            }
        }
    }

    /// Targets for any key in the alias set. A target registered under a
    /// non-canonical alias still receives snapshots.
    pub async fn targets_for(&self, alias_keys: &[String]) -> Vec<Arc<dyn PresentationTarget>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for key in alias_keys {
            if let Some(targets) = inner.get(key) {
                out.extend(targets.iter().map(|(_, target)| target.clone()));
            }
        }
        out
    }
}

/// Target that forwards snapshots into an mpsc channel. Backs the CLI's
/// watch command and the scheduler tests.
pub struct ChannelTarget {
    tx: mpsc::UnboundedSender<(String, EligibilitySnapshot)>,
}

impl ChannelTarget {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, EligibilitySnapshot)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PresentationTarget for ChannelTarget {
    fn publish(&self, product_key: &str, snapshot: &EligibilitySnapshot) {
        let _ = self.tx.send((product_key.to_string(), *snapshot));
    }
}

struct SchedulerHandle {
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
}

/// One countdown task per product key, start/stop managed as a set.
///
/// Starting a key that already has a running task replaces it: the old
/// task is told to stop before the new one spawns, so two ticks for one
/// key never run concurrently.
pub struct CountdownScheduler {
    store: ProductStore,
    resolver: Arc<dyn AliasResolver>,
    clock: Arc<dyn Clock>,
    registry: TargetRegistry,
    params: EngineParams,
    tasks: Mutex<HashMap<String, SchedulerHandle>>,
}

impl CountdownScheduler {
    pub fn new(
        store: ProductStore,
        resolver: Arc<dyn AliasResolver>,
        clock: Arc<dyn Clock>,
        registry: TargetRegistry,
        params: EngineParams,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            registry,
            params,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Start (or restart) the countdown for `product_key`.
    pub async fn start(&self, product_key: &str) {
        let alias_set = self.resolver.resolve(product_key);
        let canonical = alias_set.canonical.clone();

        let mut tasks = self.tasks.lock().await;
        // Tasks end themselves on terminal states or lost targets; sweep
        // their dead handles while the lock is held anyway.
        tasks.retain(|_, handle| handle.running.load(Ordering::Relaxed));
        if let Some(old) = tasks.remove(&canonical) {
            stop_handle(&old);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        tasks.insert(
            canonical.clone(),
            SchedulerHandle {
                running: running.clone(),
                stop_tx,
            },
        );
        drop(tasks);

        tracing::debug!(product_key = %canonical, "countdown scheduler starting");
        tokio::spawn(run_countdown_loop(
            canonical,
            alias_set.keys,
            self.store.clone(),
            self.clock.clone(),
            self.registry.clone(),
            self.params,
            running,
            stop_rx,
        ));
    }

    /// Stop the countdown for `product_key`, resolving aliases so a stop
    /// against any alias stops the canonical task. No-op when none runs.
    pub async fn stop(&self, product_key: &str) {
        let canonical = self.resolver.resolve(product_key).canonical;
        if let Some(handle) = self.tasks.lock().await.remove(&canonical) {
            stop_handle(&handle);
        }
    }

    pub async fn stop_all(&self) {
        for (_, handle) in self.tasks.lock().await.drain() {
            stop_handle(&handle);
        }
    }

    /// Whether a tick task for the key is currently live. A handle whose
    /// task already ended on its own is dropped here.
    pub async fn is_running(&self, product_key: &str) -> bool {
        let canonical = self.resolver.resolve(product_key).canonical;
        let mut tasks = self.tasks.lock().await;
        match tasks.get(&canonical) {
            Some(handle) if handle.running.load(Ordering::Relaxed) => true,
            Some(_) => {
                tasks.remove(&canonical);
                false
            }
            None => false,
        }
    }

    /// Number of keys with a tracked tick task, dead handles included
    /// until the next sweep.
    pub async fn tracked_keys(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

impl Drop for CountdownScheduler {
    fn drop(&mut self) {
        // Lock is uncontended at drop; get_mut avoids the async guard.
        for handle in self.tasks.get_mut().values() {
            stop_handle(handle);
        }
    }
}

fn stop_handle(handle: &SchedulerHandle) {
    handle.running.store(false, Ordering::Relaxed);
    let _ = handle.stop_tx.try_send(());
}

#[allow(clippy::too_many_arguments)]
async fn run_countdown_loop(
    product_key: String,
    alias_keys: Vec<String>,
    store: ProductStore,
    clock: Arc<dyn Clock>,
    registry: TargetRegistry,
    params: EngineParams,
    running: Arc<AtomicBool>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    // Discovery: wait (bounded) for the first presentation target, so
    // tracking can begin before the UI for the product has mounted.
    let mut attempts = 0;
    while registry.targets_for(&alias_keys).await.is_empty() {
        attempts += 1;
        if attempts > params.target_discovery_attempts {
            tracing::debug!(product_key = %product_key, attempts, "no presentation target appeared, scheduler exiting");
            running.store(false, Ordering::Relaxed);
            return;
        }
        tokio::select! {
            _ = stop_rx.recv() => {
                running.store(false, Ordering::Relaxed);
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(params.target_discovery_delay_ms)) => {}
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(params.tick_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::debug!(product_key = %product_key, "countdown scheduler stop requested");
                break;
            }
            _ = ticker.tick() => {}
        }

        if !running.load(Ordering::Relaxed) {
            break;
        }

        let targets = registry.targets_for(&alias_keys).await;
        if targets.is_empty() {
            tracing::debug!(product_key = %product_key, "all presentation targets gone, scheduler stopping");
            break;
        }

        // Fresh read every tick: other processes' writes (grants, resets)
        // are visible within one tick period.
        let record = match store.find_record(&alias_keys).await {
            Ok(found) => found.map(|(_, record)| record),
            Err(err) => {
                tracing::warn!(product_key = %product_key, error = %err, "store read failed, skipping tick");
                continue;
            }
        };

        let snapshot = evaluate_with(
            params.window_ms,
            params.max_downloads,
            record.as_ref(),
            clock.now_ms(),
        );
        for target in &targets {
            target.publish(&product_key, &snapshot);
        }

        if snapshot.state.is_terminal() {
            tracing::debug!(product_key = %product_key, state = ?snapshot.state, "terminal state published, scheduler stopping");
            break;
        }
    }

    running.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eligibility::EligibilityState;
    use crate::keys::{KeyCodec, StaticAliasResolver};
    use crate::record::{EntitlementRecord, MAX_DOWNLOADS, WINDOW_MS};
    use crate::store::MemoryStore;

    fn fast_params() -> EngineParams {
        EngineParams {
            tick_ms: 10,
            target_discovery_attempts: 3,
            target_discovery_delay_ms: 5,
            ..EngineParams::default()
        }
    }

    fn scheduler_with(
        resolver: Arc<dyn AliasResolver>,
        clock: Arc<ManualClock>,
    ) -> (CountdownScheduler, ProductStore) {
        let store = ProductStore::new(Arc::new(MemoryStore::new()), KeyCodec::default());
        let scheduler = CountdownScheduler::new(
            store.clone(),
            resolver,
            clock,
            TargetRegistry::new(),
            fast_params(),
        );
        (scheduler, store)
    }

    async fn next_snapshot(
        rx: &mut mpsc::UnboundedReceiver<(String, EligibilitySnapshot)>,
    ) -> EligibilitySnapshot {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed")
            .1
    }

    async fn wait_until_stopped(scheduler: &CountdownScheduler, key: &str) {
        for _ in 0..100 {
            if !scheduler.is_running(key).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler for {key} never stopped");
    }

    #[tokio::test]
    async fn test_active_record_publishes_countdown() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        let (target, mut rx) = ChannelTarget::new();
        let id = scheduler.registry().register("bundle", target).await;
        scheduler.start("bundle").await;

        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.state, EligibilityState::Active);
        assert_eq!(snapshot.remaining_downloads, MAX_DOWNLOADS);

        // Ticks keep coming while the record stays active.
        clock.advance(60_000);
        let later = next_snapshot(&mut rx).await;
        assert_eq!(later.state, EligibilityState::Active);

        scheduler.registry().unregister("bundle", id).await;
        wait_until_stopped(&scheduler, "bundle").await;
    }

    #[tokio::test]
    async fn test_tick_reflects_external_store_writes() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;
        scheduler.start("bundle").await;

        assert_eq!(
            next_snapshot(&mut rx).await.remaining_downloads,
            MAX_DOWNLOADS
        );

        // Another writer (a grant in a different process) updates the
        // record; the scheduler picks it up on a later tick.
        let mut updated = store.load_record("bundle").await.unwrap().unwrap();
        updated.apply_grant(2, clock.now_ms());
        store.save_record("bundle", &updated).await.unwrap();

        loop {
            let snapshot = next_snapshot(&mut rx).await;
            if snapshot.remaining_downloads == MAX_DOWNLOADS - 1 {
                break;
            }
        }
        scheduler.stop("bundle").await;
    }

    #[tokio::test]
    async fn test_expiry_publishes_terminal_then_stops() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;
        scheduler.start("bundle").await;

        assert_eq!(next_snapshot(&mut rx).await.state, EligibilityState::Active);

        clock.advance(WINDOW_MS + 1);

        loop {
            let snapshot = next_snapshot(&mut rx).await;
            if snapshot.state == EligibilityState::Expired {
                assert_eq!(snapshot.remaining_time_ms, 0);
                break;
            }
        }
        wait_until_stopped(&scheduler, "bundle").await;

        // Nothing ticks after the terminal snapshot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok((_, snapshot)) = rx.try_recv() {
            assert_eq!(snapshot.state, EligibilityState::Expired);
        }
    }

    #[tokio::test]
    async fn test_missing_record_reports_no_entitlement_and_stops() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, _store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock);

        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("ghost", target).await;
        scheduler.start("ghost").await;

        // NoEntitlement is not terminal: the scheduler keeps polling so a
        // purchase written by another process gets picked up.
        let snapshot = next_snapshot(&mut rx).await;
        assert_eq!(snapshot.state, EligibilityState::NoEntitlement);
        assert!(scheduler.is_running("ghost").await);

        scheduler.stop("ghost").await;
        wait_until_stopped(&scheduler, "ghost").await;
    }

    #[tokio::test]
    async fn test_no_targets_gives_up_after_bounded_discovery() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        scheduler.start("bundle").await;
        assert!(scheduler.is_running("bundle").await);

        // 3 attempts x 5ms; give it room.
        wait_until_stopped(&scheduler, "bundle").await;

        // A later explicit start with a target present re-arms it.
        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;
        scheduler.start("bundle").await;
        assert_eq!(next_snapshot(&mut rx).await.state, EligibilityState::Active);
        scheduler.stop("bundle").await;
    }

    #[tokio::test]
    async fn test_target_registered_during_discovery_is_found() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        scheduler.start("bundle").await;

        // Target shows up after the first discovery attempt.
        tokio::time::sleep(Duration::from_millis(7)).await;
        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;

        assert_eq!(next_snapshot(&mut rx).await.state, EligibilityState::Active);
        scheduler.stop("bundle").await;
    }

    #[tokio::test]
    async fn test_restart_replaces_running_task() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;

        scheduler.start("bundle").await;
        scheduler.start("bundle").await;
        assert!(scheduler.is_running("bundle").await);

        // Exactly one task ticks: snapshots arrive no faster than the tick
        // period allows for a single publisher.
        let _ = next_snapshot(&mut rx).await;
        let mut count = 0;
        let window = tokio::time::sleep(Duration::from_millis(100));
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                Some(_) = rx.recv() => count += 1,
            }
        }
        assert!(count <= 12, "two concurrent ticks detected: {count} snapshots in 100ms");

        scheduler.stop("bundle").await;
        wait_until_stopped(&scheduler, "bundle").await;
    }

    #[tokio::test]
    async fn test_alias_start_and_stop_share_one_task() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let resolver = Arc::new(StaticAliasResolver::new(vec![vec![
            "bundle".to_string(),
            "prod_123".to_string(),
        ]]));
        let (scheduler, store) = scheduler_with(resolver, clock.clone());

        // Record filed under the non-canonical alias; target registered
        // under another. Both are reachable through the alias set.
        store
            .save_record("prod_123", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();
        let (target, mut rx) = ChannelTarget::new();
        scheduler.registry().register("bundle", target).await;

        scheduler.start("prod_123").await;
        assert!(scheduler.is_running("bundle").await);
        assert_eq!(next_snapshot(&mut rx).await.state, EligibilityState::Active);

        scheduler.stop("prod_123").await;
        wait_until_stopped(&scheduler, "bundle").await;
    }

    #[tokio::test]
    async fn test_self_terminated_task_handle_is_swept() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let (scheduler, store) =
            scheduler_with(Arc::new(StaticAliasResolver::default()), clock.clone());

        store
            .save_record("bundle", &EntitlementRecord::new(clock.now_ms()))
            .await
            .unwrap();

        // No targets: the task gives up on its own after bounded discovery.
        scheduler.start("bundle").await;
        assert_eq!(scheduler.tracked_keys().await, 1);
        wait_until_stopped(&scheduler, "bundle").await;
        assert_eq!(
            scheduler.tracked_keys().await,
            0,
            "dead handle lingered after the task ended itself"
        );

        // Starting any key sweeps leftovers for other keys too.
        scheduler.start("other").await;
        // 3 discovery attempts x 5ms; give the task room to give up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.start("bundle").await;
        assert_eq!(
            scheduler.tracked_keys().await,
            1,
            "start did not sweep the dead handle for the other key"
        );
        scheduler.stop("bundle").await;
        assert_eq!(scheduler.tracked_keys().await, 0);
    }
}
