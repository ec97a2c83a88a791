//! Thread-safe package manifest cache.
//!
//! [`PackageCache`] stores at most one manifest per [`CacheKey`] together with a
//! secondary index from [`SourceKey`] to the keys that source supplied. The
//! index lets garbage collection for one source touch only that source's
//! entries.
//!
//! ## Concurrency
//!
//! Reads share a read lock and may run together. `add` and `delete` take the
//! write lock, so a mutation excludes every other mutation and every read.
//! Manifests are stored behind `Arc` and replaced wholesale, so a reader sees
//! either the previous complete manifest or the new complete manifest.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use pkgcat_core::{CacheKey, Error, PackageManifest, Result, SourceKey};

#[derive(Debug, Default)]
struct CacheState {
    manifests: HashMap<CacheKey, Arc<PackageManifest>>,
    by_source: HashMap<SourceKey, HashSet<CacheKey>>,
}

/// Keyed store of package manifests with a per-source index.
#[derive(Debug)]
pub struct PackageCache {
    global_namespace: String,
    state: RwLock<CacheState>,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("package cache lock poisoned")
}

impl PackageCache {
    /// Creates an empty cache.
    ///
    /// Entries stored in `global_namespace` are listed for every namespace.
    #[must_use]
    pub fn new(global_namespace: impl Into<String>) -> Self {
        Self {
            global_namespace: global_namespace.into(),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Returns the configured global namespace.
    #[must_use]
    pub fn global_namespace(&self) -> &str {
        &self.global_namespace
    }

    /// Inserts or replaces the manifest stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the cache lock is poisoned.
    pub fn add(&self, key: CacheKey, manifest: PackageManifest) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .by_source
            .entry(key.source().clone())
            .or_default()
            .insert(key.clone());
        state.manifests.insert(key, Arc::new(manifest));
        let count = state.manifests.len();
        drop(state);

        crate::metrics::set_cached_manifests(count);
        Ok(())
    }

    /// Removes the entry stored under `key`.
    ///
    /// Removing an absent entry succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheInconsistent`] if the entry was present in only one
    /// of the store and the index (both are cleaned up regardless), or an
    /// internal error if the cache lock is poisoned.
    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let stored = state.manifests.remove(key).is_some();
        let indexed = match state.by_source.get_mut(key.source()) {
            Some(keys) => {
                let removed = keys.remove(key);
                if keys.is_empty() {
                    state.by_source.remove(key.source());
                }
                removed
            }
            None => false,
        };
        let count = state.manifests.len();
        drop(state);

        crate::metrics::set_cached_manifests(count);
        if stored == indexed {
            Ok(())
        } else {
            Err(Error::CacheInconsistent { key: key.clone() })
        }
    }

    /// Returns the manifest named `name` stored in `namespace` (any namespace
    /// when empty).
    ///
    /// When several sources supply the same package, the one from the smallest
    /// source key (namespace, then name) is returned.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<PackageManifest>> {
        let state = self.read();
        state
            .by_source
            .keys()
            .filter(|source| namespace.is_empty() || source.namespace == namespace)
            .filter_map(|source| {
                let key = CacheKey::new(source.clone(), name);
                state.manifests.get(&key).map(|manifest| (source, manifest))
            })
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, manifest)| Arc::clone(manifest))
    }

    /// Returns the manifests visible from `namespace` that match `predicate`.
    ///
    /// An empty `namespace` lists every entry. A specific namespace lists its
    /// own entries plus those of the global namespace. Order is unspecified.
    #[must_use]
    pub fn list<P>(&self, namespace: &str, predicate: P) -> Vec<Arc<PackageManifest>>
    where
        P: Fn(&PackageManifest) -> bool,
    {
        let state = self.read();
        state
            .manifests
            .values()
            .filter(|manifest| self.visible_from(namespace, manifest))
            .filter(|manifest| predicate(manifest))
            .cloned()
            .collect()
    }

    /// Returns the keys the index holds for `source`.
    #[must_use]
    pub fn keys_for_source(&self, source: &SourceKey) -> Vec<CacheKey> {
        self.read()
            .by_source
            .get(source)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of cached manifests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().manifests.len()
    }

    /// Returns true if no manifest is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the stored manifest of `key` but leaves its index entry behind.
    #[cfg(test)]
    pub(crate) fn forget_manifest(&self, key: &CacheKey) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .manifests
            .remove(key);
    }

    fn visible_from(&self, namespace: &str, manifest: &PackageManifest) -> bool {
        namespace.is_empty()
            || manifest.namespace == namespace
            || manifest.namespace == self.global_namespace
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}
