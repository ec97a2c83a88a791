//! Read-only query front over cached package manifests.
//!
//! [`PackageProvider`] is the capability the request-serving layer consumes.
//! Two backends implement it:
//!
//! - [`RegistryProvider`]: manifests aggregated from remote catalog sources,
//!   read from the [`PackageCache`]
//! - [`StaticProvider`]: a fixed set of manifests loaded from configuration
//!
//! ## Namespace visibility
//!
//! Both backends apply the same rules. An empty namespace means all
//! namespaces. A specific namespace sees its own manifests plus those of the
//! global namespace, and every returned manifest has its `namespace` rewritten
//! to the requested one. `get` consults the requested namespace before the
//! global one. Result order of `list` is unspecified.

use std::sync::Arc;

use pkgcat_core::{PackageManifest, Result};

use crate::cache::PackageCache;
use crate::selector::LabelSelector;

/// Get/List access to package manifests.
pub trait PackageProvider: Send + Sync {
    /// Returns the manifest named `name` as seen from `namespace`.
    fn get(&self, namespace: &str, name: &str) -> Option<PackageManifest>;

    /// Returns the manifests visible from `namespace` whose labels match `selector`.
    fn list(&self, namespace: &str, selector: &LabelSelector) -> Vec<PackageManifest>;
}

/// Rewrites the namespace of a manifest read on behalf of `namespace`.
fn scoped(namespace: &str, manifest: &PackageManifest) -> PackageManifest {
    let mut manifest = manifest.clone();
    if !namespace.is_empty() {
        manifest.namespace = namespace.to_string();
    }
    manifest
}

/// Query front over manifests synchronized from catalog sources.
#[derive(Debug, Clone)]
pub struct RegistryProvider {
    cache: Arc<PackageCache>,
}

impl RegistryProvider {
    /// Creates a provider reading from `cache`.
    #[must_use]
    pub fn new(cache: Arc<PackageCache>) -> Self {
        Self { cache }
    }
}

impl PackageProvider for RegistryProvider {
    fn get(&self, namespace: &str, name: &str) -> Option<PackageManifest> {
        let global = self.cache.global_namespace();
        let found = self.cache.get(namespace, name).or_else(|| {
            (!namespace.is_empty() && namespace != global)
                .then(|| self.cache.get(global, name))
                .flatten()
        })?;
        Some(scoped(namespace, &found))
    }

    fn list(&self, namespace: &str, selector: &LabelSelector) -> Vec<PackageManifest> {
        self.cache
            .list(namespace, |manifest| selector.matches(&manifest.labels))
            .iter()
            .map(|manifest| scoped(namespace, manifest))
            .collect()
    }
}

/// Query front over a fixed set of manifests.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    global_namespace: String,
    manifests: Vec<PackageManifest>,
}

impl StaticProvider {
    /// Creates a provider serving `manifests`.
    ///
    /// Incomplete manifests (no channels, or a default channel that names none
    /// of them) are dropped with a warning.
    #[must_use]
    pub fn new(global_namespace: impl Into<String>, manifests: Vec<PackageManifest>) -> Self {
        let mut manifests: Vec<PackageManifest> = manifests
            .into_iter()
            .filter(|m| {
                let complete = m.is_complete();
                if !complete {
                    tracing::warn!(
                        namespace = %m.namespace,
                        package = %m.name,
                        default_channel = %m.status.default_channel,
                        "dropping incomplete static manifest"
                    );
                }
                complete
            })
            .collect();
        manifests.sort_by(|a, b| {
            (&a.namespace, &a.status.catalog_source, &a.name)
                .cmp(&(&b.namespace, &b.status.catalog_source, &b.name))
        });
        Self {
            global_namespace: global_namespace.into(),
            manifests,
        }
    }

    /// Loads manifests from a JSON array.
    ///
    /// # Errors
    ///
    /// Returns a decode error if `json` is not an array of manifests.
    pub fn from_json(global_namespace: impl Into<String>, json: &str) -> Result<Self> {
        let manifests: Vec<PackageManifest> = serde_json::from_str(json)?;
        Ok(Self::new(global_namespace, manifests))
    }

    fn find(&self, namespace: &str, name: &str) -> Option<&PackageManifest> {
        self.manifests
            .iter()
            .find(|m| m.name == name && (namespace.is_empty() || m.namespace == namespace))
    }
}

impl PackageProvider for StaticProvider {
    fn get(&self, namespace: &str, name: &str) -> Option<PackageManifest> {
        let found = self.find(namespace, name).or_else(|| {
            (!namespace.is_empty() && namespace != self.global_namespace)
                .then(|| self.find(&self.global_namespace, name))
                .flatten()
        })?;
        Some(scoped(namespace, found))
    }

    fn list(&self, namespace: &str, selector: &LabelSelector) -> Vec<PackageManifest> {
        self.manifests
            .iter()
            .filter(|m| {
                namespace.is_empty()
                    || m.namespace == namespace
                    || m.namespace == self.global_namespace
            })
            .filter(|m| selector.matches(&m.labels))
            .map(|m| scoped(namespace, m))
            .collect()
    }
}
