//! Integration tests for refresh cycle guarantees.
//!
//! These tests drive the synchronizer directly against in-memory registries
//! and check the cache contents observable through the query front.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pkgcat_core::observability::init_test_logging;
use pkgcat_core::{CatalogSource, PackageManifest, SourceEvent, SourceKey};
use pkgcat_sync::registry::memory::{InMemoryDialer, InMemoryRegistry, fixture_bundle};
use pkgcat_sync::{LabelSelector, PackageProvider, SyncConfig, Synchronizer};

const GLOBAL: &str = "openshift-marketplace";

struct Harness {
    sync: Synchronizer,
    dialer: InMemoryDialer,
}

impl Harness {
    fn new() -> Self {
        init_test_logging();
        let dialer = InMemoryDialer::new();
        let sync = Synchronizer::new(SyncConfig::default(), Arc::new(dialer.clone()));
        Self { sync, dialer }
    }

    async fn connect(&self, key: &SourceKey, registry: Arc<InMemoryRegistry>) {
        let address = format!("{}.{}:50051", key.name, key.namespace);
        self.dialer.insert(&address, registry);
        let source = CatalogSource::grpc(key.clone(), address);
        self.sync.handle_event(SourceEvent::Added(source)).await.unwrap();
    }

    fn snapshot(&self) -> Vec<PackageManifest> {
        let mut manifests = self
            .sync
            .provider()
            .list("", &LabelSelector::everything());
        manifests.sort_by(|a, b| {
            (&a.status.catalog_source, &a.name).cmp(&(&b.status.catalog_source, &b.name))
        });
        manifests
    }
}

fn registry_with(packages: &[&str]) -> Arc<InMemoryRegistry> {
    let registry = Arc::new(InMemoryRegistry::new());
    for name in packages {
        add_package(&registry, name);
    }
    registry
}

fn add_package(registry: &InMemoryRegistry, name: &str) {
    let stable = format!("{name}.v1");
    let alpha = format!("{name}.v2");
    registry.insert_package(name, &[("stable", &stable), ("alpha", &alpha)], "stable");
    registry.insert_bundle(name, "stable", fixture_bundle(&stable, "1.0.0", "Acme"));
    registry.insert_bundle(name, "alpha", fixture_bundle(&alpha, "2.0.0", "Acme"));
}

fn community() -> SourceKey {
    SourceKey::new("olm", "community")
}

#[tokio::test]
async fn test_single_source_round_trip() {
    let harness = Harness::new();
    harness.connect(&community(), registry_with(&["etcd", "redis"])).await;

    harness.sync.refresh(&community()).await.unwrap();

    let provider = harness.sync.provider();
    for name in ["etcd", "redis"] {
        let manifest = provider.get("olm", name).expect("manifest cached");
        assert_eq!(manifest.status.catalog_source, "community");
        assert_eq!(manifest.status.catalog_source_namespace, "olm");
        assert!(!manifest.status.channels.is_empty());
        assert!(manifest.is_complete());
    }
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let harness = Harness::new();
    harness.connect(&community(), registry_with(&["etcd", "redis", "kafka"])).await;

    harness.sync.refresh(&community()).await.unwrap();
    let first = harness.snapshot();
    let report = harness.sync.refresh(&community()).await.unwrap();
    let second = harness.snapshot();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(report.deleted, 0);
    assert_eq!(harness.sync.cache().len(), 3);
}

#[tokio::test]
async fn test_gc_on_removal_is_scoped_to_source() {
    let harness = Harness::new();
    let certified = SourceKey::new("olm", "certified");
    harness.connect(&community(), registry_with(&["etcd", "redis"])).await;
    harness.connect(&certified, registry_with(&["etcd"])).await;
    harness.sync.refresh(&community()).await.unwrap();
    harness.sync.refresh(&certified).await.unwrap();

    harness.sync.gc(&community(), &HashSet::new()).await.unwrap();

    let remaining = harness.snapshot();
    assert!(remaining.iter().all(|m| m.status.catalog_source != "community"));
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].status.catalog_source, "certified");
}

#[tokio::test]
async fn test_source_deletion_removes_entries() {
    let harness = Harness::new();
    harness.connect(&community(), registry_with(&["etcd"])).await;
    harness.sync.refresh(&community()).await.unwrap();

    harness
        .sync
        .handle_event(SourceEvent::Deleted(community()))
        .await
        .unwrap();

    assert!(harness.snapshot().is_empty());
    assert!(harness.sync.connections().is_empty());
}

#[tokio::test]
async fn test_default_channel_elision() {
    let harness = Harness::new();
    let registry = registry_with(&["etcd"]);
    registry.fail_bundle("etcd", "stable", true);
    harness.connect(&community(), Arc::clone(&registry)).await;

    harness.sync.refresh(&community()).await.unwrap();

    let manifest = harness.sync.provider().get("olm", "etcd").unwrap();
    assert_eq!(manifest.status.default_channel, "alpha");
    assert_eq!(manifest.status.channels.len(), 1);
}

#[tokio::test]
async fn test_total_failure_drops_package() {
    let harness = Harness::new();
    let registry = registry_with(&["etcd", "redis"]);
    harness.connect(&community(), Arc::clone(&registry)).await;
    harness.sync.refresh(&community()).await.unwrap();

    registry.fail_bundle("etcd", "stable", true);
    registry.fail_bundle("etcd", "alpha", true);
    let report = harness.sync.refresh(&community()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(harness.sync.provider().get("olm", "etcd").is_none());
    assert!(harness.sync.provider().get("olm", "redis").is_some());
}

#[tokio::test]
async fn test_namespace_visibility() {
    let harness = Harness::new();
    let global = SourceKey::new(GLOBAL, "community");
    harness.connect(&global, registry_with(&["etcd"])).await;
    harness.sync.refresh(&global).await.unwrap();
    let provider = harness.sync.provider();

    let other = provider.list("other-ns", &LabelSelector::everything());
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].namespace, "other-ns");
    assert_eq!(other[0].status.catalog_source_namespace, GLOBAL);

    let own = provider.list(GLOBAL, &LabelSelector::everything());
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].namespace, GLOBAL);

    let fetched = provider.get("other-ns", "etcd").unwrap();
    assert_eq!(fetched.namespace, "other-ns");
}

#[tokio::test]
async fn test_partial_listing_keeps_received_prefix() {
    let harness = Harness::new();
    let registry = registry_with(&["a", "b", "c", "d", "e"]);
    harness.connect(&community(), Arc::clone(&registry)).await;
    harness.sync.refresh(&community()).await.unwrap();

    registry.break_listing_after(Some(3));
    let report = harness.sync.refresh(&community()).await.unwrap();

    assert!(report.truncated);
    assert_eq!(report.listed, 3);
    assert_eq!(report.deleted, 2);
    let names: Vec<String> = harness.snapshot().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_label_selector_filters_list() {
    let harness = Harness::new();
    let certified = SourceKey::new("olm", "certified");
    harness.connect(&community(), registry_with(&["etcd"])).await;
    harness.connect(&certified, registry_with(&["redis"])).await;
    harness.sync.refresh(&community()).await.unwrap();
    harness.sync.refresh(&certified).await.unwrap();

    let selector = LabelSelector::parse("catalog=certified,provider=Acme").unwrap();
    let listed = harness.sync.provider().list("olm", &selector);

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "redis");
}

/// Readers running during a wide fan-out never see an incomplete manifest.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_is_never_torn() {
    let harness = Arc::new(Harness::new());
    let names: Vec<String> = (0..100).map(|i| format!("package-{i:03}")).collect();
    let registry = Arc::new(InMemoryRegistry::new());
    for name in &names {
        add_package(&registry, name);
    }
    registry.set_fetch_delay(Duration::from_millis(1));
    harness.connect(&community(), Arc::clone(&registry)).await;

    let refresher = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.sync.refresh(&community()).await })
    };

    let mut observations = 0usize;
    while !refresher.is_finished() {
        for manifest in harness.snapshot() {
            assert!(manifest.is_complete(), "torn manifest {}", manifest.name);
            assert_eq!(manifest.status.channels.len(), 2);
        }
        observations += 1;
        tokio::task::yield_now().await;
    }

    let report = refresher.await.unwrap().unwrap();
    assert_eq!(report.built, 100);
    assert_eq!(harness.sync.cache().len(), 100);
    assert!(observations > 0);
}
