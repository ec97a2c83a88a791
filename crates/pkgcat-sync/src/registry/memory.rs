//! In-memory registry implementation for testing.
//!
//! This module provides [`InMemoryRegistry`], a catalog held in process memory,
//! and [`InMemoryDialer`], which hands out registries by address. Both support
//! failure injection so tests can exercise elision, partial listings and
//! connectivity changes.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No network transport
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::json;

use pkgcat_core::{Error, Result};

use super::{Bundle, PackageNameStream, RawChannel, RawPackage, RegistryClient, RegistryDialer};
use crate::connection::ConnectivityState;

#[derive(Debug)]
struct RegistryState {
    packages: BTreeMap<String, RawPackage>,
    bundles: HashMap<(String, String), Bundle>,
    failing_bundles: HashSet<(String, String)>,
    failing_packages: HashSet<String>,
    list_break_after: Option<usize>,
    fetch_delay: Duration,
    probe_state: ConnectivityState,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory catalog for testing.
///
/// ## Example
///
/// ```rust
/// use pkgcat_sync::registry::memory::{InMemoryRegistry, fixture_bundle};
///
/// let registry = InMemoryRegistry::new();
/// registry.insert_package("etcd", &[("stable", "etcd.v1")], "stable");
/// registry.insert_bundle("etcd", "stable", fixture_bundle("etcd.v1", "1.0.0", "CoreOS"));
/// ```
#[derive(Debug)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Creates an empty registry that probes as `Ready`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                packages: BTreeMap::new(),
                bundles: HashMap::new(),
                failing_bundles: HashSet::new(),
                failing_packages: HashSet::new(),
                list_break_after: None,
                fetch_delay: Duration::ZERO,
                probe_state: ConnectivityState::Ready,
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a package with `(channel, head version)` pairs.
    pub fn insert_package(&self, name: &str, channels: &[(&str, &str)], default_channel: &str) {
        let package = RawPackage {
            name: name.to_string(),
            channels: channels
                .iter()
                .map(|(channel, csv)| RawChannel {
                    name: (*channel).to_string(),
                    csv_name: (*csv).to_string(),
                })
                .collect(),
            default_channel_name: default_channel.to_string(),
        };
        self.state().packages.insert(name.to_string(), package);
    }

    /// Sets the head bundle of a channel.
    pub fn insert_bundle(&self, package: &str, channel: &str, bundle: Bundle) {
        self.state()
            .bundles
            .insert((package.to_string(), channel.to_string()), bundle);
    }

    /// Removes a package and its bundles.
    pub fn remove_package(&self, name: &str) {
        let mut state = self.state();
        state.packages.remove(name);
        state.bundles.retain(|(package, _), _| package != name);
    }

    /// Makes bundle fetches for one channel fail (or succeed again).
    pub fn fail_bundle(&self, package: &str, channel: &str, fail: bool) {
        let key = (package.to_string(), channel.to_string());
        let mut state = self.state();
        if fail {
            state.failing_bundles.insert(key);
        } else {
            state.failing_bundles.remove(&key);
        }
    }

    /// Makes package fetches for one package fail.
    pub fn fail_package(&self, package: &str) {
        self.state().failing_packages.insert(package.to_string());
    }

    /// Breaks package listings with a transport error after `count` names.
    pub fn break_listing_after(&self, count: Option<usize>) {
        self.state().list_break_after = count;
    }

    /// Delays every package and bundle fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = delay;
    }

    /// Sets the state subsequent probes report.
    pub fn set_probe_state(&self, state: ConnectivityState) {
        self.state().probe_state = state;
    }

    /// Returns the highest number of package and bundle fetches observed in
    /// flight at once.
    #[must_use]
    pub fn max_concurrent_fetches(&self) -> usize {
        self.state().max_in_flight
    }

    async fn delay(&self) {
        let delay = {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.fetch_delay
        };
        let _in_flight = InFlight(self);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

struct InFlight<'a>(&'a InMemoryRegistry);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state().in_flight -= 1;
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn list_packages(&self) -> Result<PackageNameStream> {
        let (names, break_after) = {
            let state = self.state();
            let names: Vec<String> = state.packages.keys().cloned().collect();
            (names, state.list_break_after)
        };

        let mut items: Vec<Result<String>> = names.into_iter().map(Ok).collect();
        if let Some(count) = break_after {
            items.truncate(count);
            items.push(Err(Error::connection("package listing interrupted")));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn get_package(&self, name: &str) -> Result<RawPackage> {
        self.delay().await;
        let state = self.state();
        if state.failing_packages.contains(name) {
            return Err(Error::registry(500, format!("injected failure for package {name}")));
        }
        state
            .packages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::registry(404, format!("package {name} not found")))
    }

    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle> {
        self.delay().await;
        let key = (package.to_string(), channel.to_string());
        let state = self.state();
        if state.failing_bundles.contains(&key) {
            return Err(Error::registry(
                500,
                format!("injected failure for {package}/{channel}"),
            ));
        }
        state
            .bundles
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::registry(404, format!("no bundle for {package}/{channel}")))
    }

    async fn probe(&self) -> ConnectivityState {
        self.state().probe_state
    }
}

#[derive(Debug, Default)]
struct DialerState {
    registries: HashMap<String, Arc<InMemoryRegistry>>,
    dials: HashMap<String, usize>,
}

/// Dialer resolving addresses to [`InMemoryRegistry`] instances.
///
/// Clones share state. Dialing an unknown address fails with a connection error.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDialer {
    state: Arc<Mutex<DialerState>>,
}

impl InMemoryDialer {
    /// Creates a dialer with no registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `registry` at `address`.
    #[must_use]
    pub fn with_registry(self, address: &str, registry: Arc<InMemoryRegistry>) -> Self {
        self.insert(address, registry);
        self
    }

    /// Registers `registry` at `address`, replacing any previous one.
    pub fn insert(&self, address: &str, registry: Arc<InMemoryRegistry>) {
        self.lock().registries.insert(address.to_string(), registry);
    }

    /// Returns how many times `address` was dialed successfully.
    #[must_use]
    pub fn dial_count(&self, address: &str) -> usize {
        self.lock().dials.get(address).copied().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DialerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RegistryDialer for InMemoryDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn RegistryClient>> {
        let mut state = self.lock();
        let registry = state
            .registries
            .get(address)
            .cloned()
            .ok_or_else(|| Error::connection(format!("no registry listening at {address}")))?;
        *state.dials.entry(address.to_string()).or_default() += 1;
        Ok(registry as Arc<dyn RegistryClient>)
    }
}

/// Builds a bundle whose version metadata names `csv_name`.
#[must_use]
pub fn fixture_bundle(csv_name: &str, version: &str, provider: &str) -> Bundle {
    let provider_url = format!("https://{}.example.com", provider.to_lowercase());
    let csv = json!({
        "metadata": {
            "name": csv_name,
            "annotations": {
                "description": format!("{csv_name} operator"),
                "capabilities": "Basic Install"
            }
        },
        "spec": {
            "displayName": csv_name,
            "version": version,
            "provider": { "name": provider, "url": provider_url },
            "icon": [{ "base64data": "aWNvbg==", "mediatype": "image/png" }],
            "installModes": [
                { "type": "OwnNamespace", "supported": true },
                { "type": "AllNamespaces", "supported": true }
            ]
        }
    });
    Bundle {
        csv_json: csv.to_string(),
        object: Vec::new(),
    }
}
