//! Cache synchronization control loop.
//!
//! The [`Synchronizer`] reacts to catalog-source lifecycle events and to
//! connectivity changes reported by its [`ConnectionManager`]:
//!
//! | Input | Action |
//! |-------|--------|
//! | source added/updated, same address | refresh |
//! | source added/updated, new address | (re)connect, wait for `Ready` |
//! | connectivity → `Ready` | refresh |
//! | connectivity → `TransientFailure`/`Shutdown` | gc with an empty kept set |
//! | source deleted | disconnect, gc with an empty kept set |
//!
//! ## Refresh cycle
//!
//! 1. List package names. A broken listing stops early; the names received
//!    so far are still refreshed.
//! 2. Fetch and build every package concurrently, one task per package. Each
//!    successful build is written to the cache at once and recorded in the
//!    cycle's kept set.
//! 3. After every task finished, delete the source's cache entries that are
//!    not in the kept set.
//!
//! A cycle is bounded by [`SyncConfig::refresh_timeout`]. When the deadline
//! passes, in-flight tasks are cancelled and the cycle proceeds to garbage
//! collection with what was built.
//!
//! ## Serialization
//!
//! At most one refresh or gc runs per source key at any time. [`Synchronizer::run`]
//! additionally routes all work for a key through one worker queue, so events
//! for a key are handled in arrival order while different keys proceed
//! concurrently.
//!
//! Pending work is coalesced per key: a queued lifecycle event is superseded by
//! a newer one (a deletion supersedes everything queued), and a queued
//! connectivity change by a newer change. A key's queue therefore never holds
//! more than one event and one change. The worker of a deleted key retires once
//! its queue is empty, so a later event for the key starts a fresh worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use pkgcat_core::observability::source_span;
use pkgcat_core::{CacheKey, CatalogSource, Error, PackageManifest, Result, SourceEvent, SourceKey};

use crate::builder;
use crate::cache::PackageCache;
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectivityState, StateChange};
use crate::query::RegistryProvider;
use crate::registry::{RegistryClient, RegistryDialer};

/// Summary of one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// The refreshed catalog source.
    pub source: SourceKey,
    /// Distinct package names received from the listing.
    pub listed: usize,
    /// Packages built and written to the cache.
    pub built: usize,
    /// Packages whose build failed or was cancelled.
    pub failed: usize,
    /// Stale entries removed by garbage collection.
    pub deleted: usize,
    /// True if the listing broke early or the deadline passed.
    pub truncated: bool,
}

enum PackageOutcome {
    Built,
    Failed,
    Cancelled,
}

#[derive(Debug)]
enum Work {
    Event(SourceEvent),
    Change(StateChange),
}

impl Work {
    fn key(&self) -> &SourceKey {
        match self {
            Self::Event(event) => event.key(),
            Self::Change(change) => &change.key,
        }
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Work>,
    retired: bool,
}

/// Coalescing work queue of one source key.
#[derive(Default)]
struct KeyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

enum Next {
    Work(Work),
    Idle,
    Retired,
}

impl KeyQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `work`, dropping the pending work it supersedes.
    ///
    /// Hands `work` back if the queue's worker has retired.
    fn push(&self, work: Work) -> std::result::Result<(), Work> {
        let mut state = self.lock();
        if state.retired {
            return Err(work);
        }
        match &work {
            Work::Event(SourceEvent::Deleted(_)) => state.items.clear(),
            Work::Event(_) => state.items.retain(|queued| !matches!(queued, Work::Event(_))),
            Work::Change(_) => state.items.retain(|queued| !matches!(queued, Work::Change(_))),
        }
        state.items.push_back(work);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the oldest work. An empty queue retires unless its key is `tracked`.
    fn next(&self, tracked: bool) -> Next {
        let mut state = self.lock();
        match state.items.pop_front() {
            Some(work) => Next::Work(work),
            None if !tracked => {
                state.retired = true;
                Next::Retired
            }
            None => Next::Idle,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().items.len()
    }
}

/// Keeps the package cache in sync with the known catalog sources.
pub struct Synchronizer {
    config: SyncConfig,
    cache: Arc<PackageCache>,
    connections: ConnectionManager,
    sources: RwLock<HashMap<SourceKey, CatalogSource>>,
    locks: Mutex<HashMap<SourceKey, Arc<AsyncMutex<()>>>>,
    changes: Mutex<Option<mpsc::UnboundedReceiver<StateChange>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    /// Creates a synchronizer with an empty cache.
    ///
    /// Connections are opened through `dialer`.
    #[must_use]
    pub fn new(config: SyncConfig, dialer: Arc<dyn RegistryDialer>) -> Self {
        let (observer, changes) = mpsc::unbounded_channel();
        let connections = ConnectionManager::new(dialer, Arc::new(observer), config.probe_interval);
        Self {
            cache: Arc::new(PackageCache::new(config.global_namespace.clone())),
            config,
            connections,
            sources: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            changes: Mutex::new(Some(changes)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the cache this synchronizer writes to.
    #[must_use]
    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.cache
    }

    /// Returns a query front over the cache.
    #[must_use]
    pub fn provider(&self) -> RegistryProvider {
        RegistryProvider::new(Arc::clone(&self.cache))
    }

    /// Returns the connection manager.
    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Handles one catalog-source lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns an error if the source has an unsupported type, has no address,
    /// cannot be dialed, or if the triggered refresh or gc fails. Cache entries
    /// are left untouched in the first three cases.
    pub async fn handle_event(&self, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Added(source) | SourceEvent::Updated(source) => {
                self.upsert_source(source).await
            }
            SourceEvent::Deleted(key) => self.delete_source(&key).await,
        }
    }

    /// Handles one connectivity state change.
    ///
    /// # Errors
    ///
    /// Returns an error if the triggered refresh or gc fails.
    pub async fn handle_state_change(&self, change: StateChange) -> Result<()> {
        match change.state {
            ConnectivityState::Ready => self.refresh(&change.key).await.map(|_| ()),
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                self.gc(&change.key, &HashSet::new()).await.map(|_| ())
            }
            ConnectivityState::Connecting => Ok(()),
        }
    }

    /// Rebuilds every cache entry of one catalog source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedSourceType`] for sources this engine does not
    /// aggregate, [`Error::NotConnected`] if the source has no connection, a
    /// connection error if the listing cannot be started, and
    /// [`Error::GcFailed`] if stale entries could not all be deleted. The cache
    /// is untouched in all but the last case.
    pub async fn refresh(&self, key: &SourceKey) -> Result<RefreshReport> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let source = self.source(key).ok_or_else(|| Error::NotConnected {
            source_key: key.clone(),
        })?;
        if !self.config.supports(&source.source_type) {
            return Err(Error::UnsupportedSourceType {
                source_key: key.clone(),
                source_type: source.source_type,
            });
        }
        let client = self
            .connections
            .client(key)
            .ok_or_else(|| Error::NotConnected {
                source_key: key.clone(),
            })?;

        let started = Instant::now();
        let result = self
            .refresh_cycle(&source, client)
            .instrument(source_span("refresh", key))
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(report) => {
                let outcome = if report.truncated { "truncated" } else { "success" };
                let built = u64::try_from(report.built).unwrap_or(u64::MAX);
                let failed = u64::try_from(report.failed).unwrap_or(u64::MAX);
                crate::metrics::record_refresh(outcome, built, failed, elapsed);
            }
            Err(Error::GcFailed { .. }) => {
                crate::metrics::record_refresh("gc_failed", 0, 0, elapsed);
            }
            Err(_) => crate::metrics::record_refresh("error", 0, 0, elapsed),
        }
        result
    }

    /// Deletes the cache entries of `key` whose package is not in `kept`.
    ///
    /// Returns the number of deleted entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GcFailed`] listing every entry that could not be
    /// deleted; the remaining entries are still attempted.
    pub async fn gc(&self, key: &SourceKey, kept: &HashSet<String>) -> Result<usize> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let span = source_span("gc", key);
        let _entered = span.enter();
        self.gc_locked(key, kept)
    }

    /// Runs the control loop until `shutdown` is cancelled or `events` closes.
    ///
    /// On exit every in-flight cycle is cancelled and every connection closed.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the loop is already running.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut changes = self
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::internal("synchronizer control loop is already running"))?;

        let mut queues: HashMap<SourceKey, Arc<KeyQueue>> = HashMap::new();
        let mut workers = JoinSet::new();
        tracing::info!("synchronizer started");

        loop {
            let work = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = self.shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(key) => {
                            if queues.get(&key).is_some_and(|queue| queue.lock().retired) {
                                queues.remove(&key);
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "synchronizer worker failed"),
                    }
                    continue;
                }
                Some(change) = changes.recv() => Work::Change(change),
                event = events.recv() => match event {
                    Some(event) => Work::Event(event),
                    None => {
                        tracing::info!("source event stream closed");
                        break;
                    }
                },
            };

            let key = work.key().clone();
            let work = match queues.get(&key) {
                Some(queue) => match queue.push(work) {
                    Ok(()) => continue,
                    Err(work) => work,
                },
                None => work,
            };

            let queue = Arc::new(KeyQueue::default());
            if queue.push(work).is_err() {
                tracing::warn!(source = %key, "fresh worker queue refused work");
                continue;
            }
            workers.spawn(
                worker(Arc::clone(&self), key.clone(), Arc::clone(&queue))
                    .instrument(tracing::Span::current()),
            );
            queues.insert(key, queue);
        }

        tracing::info!("synchronizer stopping");
        self.shutdown.cancel();
        drop(queues);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "synchronizer worker failed");
            }
        }
        self.connections.shutdown().await;
        tracing::info!("synchronizer stopped");
        Ok(())
    }

    /// Cancels every in-flight cycle and closes every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.shutdown().await;
    }

    async fn upsert_source(&self, source: CatalogSource) -> Result<()> {
        let key = source.key.clone();
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), source.clone());

        if !self.config.supports(&source.source_type) {
            return Err(Error::UnsupportedSourceType {
                source_key: key,
                source_type: source.source_type,
            });
        }
        let Some(address) = source.address.as_deref() else {
            return Err(Error::connection(format!(
                "catalog source {key} has no registry address"
            )));
        };

        if let Some(meta) = self.connections.get_meta(&key) {
            if meta.address == address && meta.state != ConnectivityState::Shutdown {
                tracing::debug!(source = %key, state = %meta.state, "source unchanged; refreshing");
                return self.refresh(&key).await.map(|_| ());
            }
        }

        if let Err(e) = self.connections.add(&key, address).await {
            tracing::warn!(
                source = %key,
                address = %address,
                error = %e,
                "failed to connect to catalog source"
            );
            return Err(e);
        }
        Ok(())
    }

    async fn delete_source(&self, key: &SourceKey) -> Result<()> {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.connections.remove(key).await?;
        let result = self.gc(key, &HashSet::new()).await.map(|_| ());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
        result
    }

    async fn refresh_cycle(
        &self,
        source: &CatalogSource,
        client: Arc<dyn RegistryClient>,
    ) -> Result<RefreshReport> {
        let key = &source.key;
        let deadline = tokio::time::Instant::now() + self.config.refresh_timeout;
        let cancel = self.shutdown.child_token();
        let mut report = RefreshReport {
            source: key.clone(),
            listed: 0,
            built: 0,
            failed: 0,
            deleted: 0,
            truncated: false,
        };

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::internal("refresh cancelled by shutdown")),
            () = tokio::time::sleep_until(deadline) => {
                return Err(Error::connection(format!("listing packages of {key} timed out")));
            }
            listing = client.list_packages() => listing?,
        };

        let mut names = Vec::new();
        let mut seen = HashSet::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("refresh deadline passed while listing packages");
                    report.truncated = true;
                    None
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(name)) => {
                    if seen.insert(name.clone()) {
                        names.push(name);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        error = %e,
                        received = names.len(),
                        "package listing broke; refreshing partial list"
                    );
                    report.truncated = true;
                    break;
                }
                None => break,
            }
        }
        drop(stream);
        report.listed = names.len();

        let kept = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = JoinSet::new();
        for name in names {
            tasks.spawn(
                build_package(
                    source.clone(),
                    name,
                    Arc::clone(&client),
                    Arc::clone(&self.cache),
                    Arc::clone(&kept),
                    cancel.clone(),
                )
                .in_current_span(),
            );
        }

        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok(PackageOutcome::Built)) => report.built += 1,
                    Some(Ok(PackageOutcome::Failed | PackageOutcome::Cancelled)) => {
                        report.failed += 1;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "package build task failed");
                        report.failed += 1;
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline), if !cancel.is_cancelled() => {
                    tracing::warn!(
                        pending = tasks.len(),
                        "refresh deadline passed; cancelling package builds"
                    );
                    report.truncated = true;
                    cancel.cancel();
                }
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(Error::internal("refresh cancelled by shutdown"));
        }

        let kept = std::mem::take(&mut *kept.lock().unwrap_or_else(PoisonError::into_inner));
        report.deleted = self.gc_locked(key, &kept)?;

        tracing::info!(
            listed = report.listed,
            built = report.built,
            failed = report.failed,
            deleted = report.deleted,
            truncated = report.truncated,
            "refresh complete"
        );
        Ok(report)
    }

    fn gc_locked(&self, key: &SourceKey, kept: &HashSet<String>) -> Result<usize> {
        let mut deleted = 0;
        let mut failures = Vec::new();
        for cache_key in self.cache.keys_for_source(key) {
            if kept.contains(cache_key.package()) {
                continue;
            }
            match self.cache.delete(&cache_key) {
                Ok(()) => deleted += 1,
                Err(e) => failures.push(format!("{cache_key}: {e}")),
            }
        }
        crate::metrics::record_gc(
            u64::try_from(deleted).unwrap_or(u64::MAX),
            u64::try_from(failures.len()).unwrap_or(u64::MAX),
        );

        if failures.is_empty() {
            tracing::debug!(deleted, kept = kept.len(), "garbage collection complete");
            Ok(deleted)
        } else {
            tracing::error!(deleted, failed = failures.len(), "garbage collection incomplete");
            Err(Error::GcFailed {
                source_key: key.clone(),
                failures,
            })
        }
    }

    fn source(&self, key: &SourceKey) -> Option<CatalogSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn key_lock(&self, key: &SourceKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn dispatch(&self, work: Work) {
        let key = work.key().clone();
        let result = match work {
            Work::Event(event) => self.handle_event(event).await,
            Work::Change(change) => self.handle_state_change(change).await,
        };
        match result {
            Ok(()) => {}
            Err(e @ (Error::NotConnected { .. } | Error::UnsupportedSourceType { .. })) => {
                tracing::debug!(source = %key, error = %e, "catalog source skipped");
            }
            Err(e) => tracing::warn!(source = %key, error = %e, "catalog source sync failed"),
        }
    }
}

/// Drains one key's work queue in order until shutdown, or until the key is no
/// longer a known source and nothing else is queued. Returns the key it served.
async fn worker(sync: Arc<Synchronizer>, key: SourceKey, queue: Arc<KeyQueue>) -> SourceKey {
    loop {
        if sync.shutdown.is_cancelled() {
            return key;
        }
        match queue.next(sync.source(&key).is_some()) {
            Next::Work(work) => sync.dispatch(work).await,
            Next::Retired => {
                tracing::debug!(source = %key, "catalog source gone; worker retired");
                return key;
            }
            Next::Idle => {
                tokio::select! {
                    () = sync.shutdown.cancelled() => return key,
                    () = queue.notify.notified() => {}
                }
            }
        }
    }
}

async fn build_package(
    source: CatalogSource,
    name: String,
    client: Arc<dyn RegistryClient>,
    cache: Arc<PackageCache>,
    kept: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
) -> PackageOutcome {
    let built = tokio::select! {
        biased;
        () = cancel.cancelled() => return PackageOutcome::Cancelled,
        built = fetch_and_build(&source, &name, client.as_ref()) => built,
    };

    let manifest = match built {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!(package = %name, error = %e, "package build failed; skipping");
            return PackageOutcome::Failed;
        }
    };

    let key = CacheKey::new(source.key.clone(), name.clone());
    if let Err(e) = cache.add(key, manifest) {
        tracing::error!(package = %name, error = %e, "failed to cache package manifest");
        return PackageOutcome::Failed;
    }
    kept.lock().unwrap_or_else(PoisonError::into_inner).insert(name);
    PackageOutcome::Built
}

async fn fetch_and_build(
    source: &CatalogSource,
    name: &str,
    client: &dyn RegistryClient,
) -> Result<PackageManifest> {
    let package = client.get_package(name).await?;
    builder::build(source, &package, client).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::{InMemoryDialer, InMemoryRegistry, fixture_bundle};
    use std::time::Duration;

    const ADDRESS: &str = "community.olm:50051";

    fn registry(packages: &[&str]) -> Arc<InMemoryRegistry> {
        let registry = Arc::new(InMemoryRegistry::new());
        for name in packages {
            let csv = format!("{name}.v1");
            registry.insert_package(name, &[("stable", &csv)], "stable");
            registry.insert_bundle(name, "stable", fixture_bundle(&csv, "1.0.0", "Acme"));
        }
        registry
    }

    fn source() -> CatalogSource {
        CatalogSource::grpc(SourceKey::new("olm", "community"), ADDRESS)
    }

    fn synchronizer(registry: Arc<InMemoryRegistry>, config: SyncConfig) -> Synchronizer {
        let dialer = InMemoryDialer::new().with_registry(ADDRESS, registry);
        Synchronizer::new(config, Arc::new(dialer))
    }

    async fn connected(registry: Arc<InMemoryRegistry>) -> Synchronizer {
        let sync = synchronizer(registry, SyncConfig::default());
        sync.handle_event(SourceEvent::Added(source())).await.unwrap();
        sync
    }

    #[tokio::test]
    async fn refresh_populates_cache() {
        let sync = connected(registry(&["etcd", "redis"])).await;

        let report = sync.refresh(&source().key).await.unwrap();

        assert_eq!(report.listed, 2);
        assert_eq!(report.built, 2);
        assert!(!report.truncated);
        let etcd = sync.cache().get("olm", "etcd").unwrap();
        assert_eq!(etcd.status.catalog_source, "community");
        assert!(etcd.is_complete());
    }

    #[tokio::test]
    async fn refresh_removes_packages_that_disappear() {
        let registry = registry(&["etcd", "redis"]);
        let sync = connected(Arc::clone(&registry)).await;
        sync.refresh(&source().key).await.unwrap();

        registry.remove_package("redis");
        let report = sync.refresh(&source().key).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(sync.cache().get("olm", "redis").is_none());
        assert!(sync.cache().get("olm", "etcd").is_some());
    }

    #[tokio::test]
    async fn unbuildable_package_is_dropped_without_affecting_siblings() {
        let registry = registry(&["etcd", "redis"]);
        let sync = connected(Arc::clone(&registry)).await;
        sync.refresh(&source().key).await.unwrap();

        registry.fail_bundle("redis", "stable", true);
        let report = sync.refresh(&source().key).await.unwrap();

        assert_eq!(report.built, 1);
        assert_eq!(report.failed, 1);
        assert!(sync.cache().get("olm", "redis").is_none());
        assert!(sync.cache().get("olm", "etcd").is_some());
    }

    #[tokio::test]
    async fn refresh_without_connection_is_refused() {
        let sync = synchronizer(registry(&["etcd"]), SyncConfig::default());

        let err = sync.refresh(&source().key).await.unwrap_err();

        assert!(matches!(err, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn transient_failure_clears_source_entries() {
        let sync = connected(registry(&["etcd", "redis"])).await;
        sync.refresh(&source().key).await.unwrap();

        sync.handle_state_change(StateChange {
            key: source().key,
            state: ConnectivityState::TransientFailure,
        })
        .await
        .unwrap();

        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn delete_disconnects_and_clears_entries() {
        let sync = connected(registry(&["etcd"])).await;
        sync.refresh(&source().key).await.unwrap();

        sync.handle_event(SourceEvent::Deleted(source().key)).await.unwrap();

        assert!(sync.cache().is_empty());
        assert!(sync.connections().get_meta(&source().key).is_none());
    }

    #[tokio::test]
    async fn update_with_same_address_refreshes_without_redialing() {
        let registry = registry(&["etcd"]);
        let dialer = InMemoryDialer::new().with_registry(ADDRESS, Arc::clone(&registry));
        let sync = Synchronizer::new(SyncConfig::default(), Arc::new(dialer.clone()));
        sync.handle_event(SourceEvent::Added(source())).await.unwrap();
        assert!(sync.cache().is_empty());

        sync.handle_event(SourceEvent::Updated(source())).await.unwrap();

        assert_eq!(dialer.dial_count(ADDRESS), 1);
        assert!(sync.cache().get("olm", "etcd").is_some());
    }

    #[tokio::test]
    async fn unsupported_source_type_is_refused_and_cache_untouched() {
        let sync = connected(registry(&["etcd"])).await;
        sync.refresh(&source().key).await.unwrap();

        let mut configmap = source();
        configmap.source_type = pkgcat_core::source::SOURCE_TYPE_CONFIGMAP.to_string();
        let err = sync.handle_event(SourceEvent::Updated(configmap)).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSourceType { .. }));

        let err = sync.refresh(&source().key).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSourceType { .. }));
        assert!(sync.cache().get("olm", "etcd").is_some());
    }

    #[tokio::test]
    async fn dial_failure_leaves_source_unconnected() {
        let sync = synchronizer(registry(&["etcd"]), SyncConfig::default());
        let elsewhere = CatalogSource::grpc(SourceKey::new("olm", "other"), "nowhere:50051");

        let err = sync.handle_event(SourceEvent::Added(elsewhere)).await.unwrap_err();

        assert!(err.is_transport());
        assert!(sync.connections().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_slow_builds() {
        let registry = registry(&["etcd", "redis"]);
        let config = SyncConfig {
            refresh_timeout: Duration::from_secs(1),
            ..SyncConfig::default()
        };
        let sync = synchronizer(Arc::clone(&registry), config);
        sync.handle_event(SourceEvent::Added(source())).await.unwrap();
        registry.set_fetch_delay(Duration::from_secs(10));

        let report = sync.refresh(&source().key).await.unwrap();

        assert!(report.truncated);
        assert_eq!(report.listed, 2);
        assert_eq!(report.built, 0);
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn gc_keeps_listed_packages() {
        let sync = connected(registry(&["etcd", "redis", "kafka"])).await;
        sync.refresh(&source().key).await.unwrap();

        let kept = HashSet::from(["redis".to_string()]);
        let deleted = sync.gc(&source().key, &kept).await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(sync.cache().len(), 1);
    }

    #[tokio::test]
    async fn gc_continues_past_failed_deletions() {
        let sync = connected(registry(&["etcd", "redis", "kafka"])).await;
        sync.refresh(&source().key).await.unwrap();
        sync.cache().forget_manifest(&CacheKey::new(source().key, "redis"));

        let err = sync.gc(&source().key, &HashSet::new()).await.unwrap_err();

        let Error::GcFailed { source_key, failures } = err else {
            panic!("expected GcFailed, got {err:?}");
        };
        assert_eq!(source_key, source().key);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("redis"));
        assert!(sync.cache().keys_for_source(&source().key).is_empty());
    }

    #[tokio::test]
    async fn refresh_and_gc_of_one_source_never_overlap() {
        let registry = registry(&["etcd"]);
        let sync = connected(Arc::clone(&registry)).await;
        registry.set_fetch_delay(Duration::from_millis(20));
        let key = source().key;
        let keep = HashSet::new();

        let (first, collected, second) = tokio::join!(
            sync.refresh(&key),
            sync.gc(&key, &keep),
            sync.refresh(&key),
        );

        assert_eq!(first.unwrap().built, 1);
        collected.unwrap();
        assert_eq!(second.unwrap().built, 1);
        assert_eq!(registry.max_concurrent_fetches(), 1);
        assert_eq!(sync.cache().len(), 1);
        assert!(sync.cache().get("olm", "etcd").unwrap().is_complete());
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_refresh_and_skips_gc() {
        let registry = registry(&["etcd", "redis"]);
        let sync = Arc::new(connected(Arc::clone(&registry)).await);
        sync.refresh(&source().key).await.unwrap();
        registry.set_fetch_delay(Duration::from_secs(10));

        let refresh = tokio::spawn({
            let sync = Arc::clone(&sync);
            async move { sync.refresh(&source().key).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sync.shutdown().await;

        let err = tokio::time::timeout(Duration::from_secs(1), refresh)
            .await
            .expect("refresh should stop promptly")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("cancelled by shutdown"));
        assert_eq!(sync.cache().len(), 2);
    }

    fn updated() -> Work {
        Work::Event(SourceEvent::Updated(source()))
    }

    fn change(state: ConnectivityState) -> Work {
        Work::Change(StateChange {
            key: source().key,
            state,
        })
    }

    #[test]
    fn queue_keeps_only_latest_lifecycle_event() {
        let queue = KeyQueue::default();
        for _ in 0..30 {
            queue.push(updated()).unwrap();
        }
        assert_eq!(queue.len(), 1);

        queue.push(change(ConnectivityState::Ready)).unwrap();
        queue.push(change(ConnectivityState::TransientFailure)).unwrap();
        assert_eq!(queue.len(), 2);

        queue.push(Work::Event(SourceEvent::Deleted(source().key))).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(matches!(
            queue.next(true),
            Next::Work(Work::Event(SourceEvent::Deleted(_)))
        ));
    }

    #[test]
    fn queue_keeps_latest_change_after_pending_event() {
        let queue = KeyQueue::default();
        queue.push(change(ConnectivityState::Ready)).unwrap();
        queue.push(updated()).unwrap();
        queue.push(change(ConnectivityState::Shutdown)).unwrap();

        assert!(matches!(queue.next(true), Next::Work(Work::Event(_))));
        assert!(matches!(
            queue.next(true),
            Next::Work(Work::Change(StateChange { state: ConnectivityState::Shutdown, .. }))
        ));
        assert!(matches!(queue.next(true), Next::Idle));
    }

    #[test]
    fn empty_queue_of_untracked_key_retires() {
        let queue = KeyQueue::default();
        assert!(matches!(queue.next(false), Next::Retired));

        assert!(queue.push(updated()).is_err());
    }

    #[tokio::test]
    async fn worker_retires_after_deletion() {
        let sync = Arc::new(connected(registry(&["etcd"])).await);
        let queue = Arc::new(KeyQueue::default());
        queue.push(updated()).unwrap();
        queue.push(Work::Event(SourceEvent::Deleted(source().key))).unwrap();

        let key = tokio::time::timeout(
            Duration::from_secs(1),
            worker(Arc::clone(&sync), source().key, Arc::clone(&queue)),
        )
        .await
        .expect("worker should retire");

        assert_eq!(key, source().key);
        assert!(queue.push(updated()).is_err());
        assert!(sync.connections().get_meta(&source().key).is_none());
    }

    #[tokio::test]
    async fn worker_of_tracked_source_waits_until_shutdown() {
        let sync = Arc::new(connected(registry(&["etcd"])).await);
        let queue = Arc::new(KeyQueue::default());
        let handle = tokio::spawn(worker(Arc::clone(&sync), source().key, Arc::clone(&queue)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        queue.push(updated()).unwrap();

        sync.shutdown().await;
        let key = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop on shutdown")
            .unwrap();
        assert_eq!(key, source().key);
    }
}
