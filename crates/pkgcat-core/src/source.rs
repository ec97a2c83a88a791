//! Catalog source identity and lifecycle events.
//!
//! A catalog source is identified by its `(namespace, name)` pair. Discovery
//! collaborators observe sources appearing, changing and disappearing, and
//! translate each observation into a [`SourceEvent`] exactly once, at the
//! boundary. The engine never inspects untyped payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source type aggregated over the remote registry protocol.
pub const SOURCE_TYPE_GRPC: &str = "grpc";

/// Source type served by the in-cluster config loader.
pub const SOURCE_TYPE_CONFIGMAP: &str = "configmap";

/// Identity of one catalog source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    /// Namespace the catalog source lives in.
    pub namespace: String,
    /// Name of the catalog source.
    pub name: String,
}

impl SourceKey {
    /// Creates a new source key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of one entry in the package cache.
///
/// At most one manifest exists per cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    source: SourceKey,
    package: String,
}

impl CacheKey {
    /// Creates a new cache key for `package` served by `source`.
    #[must_use]
    pub fn new(source: SourceKey, package: impl Into<String>) -> Self {
        Self {
            source,
            package: package.into(),
        }
    }

    /// Returns the catalog source that supplied the entry.
    #[must_use]
    pub fn source(&self) -> &SourceKey {
        &self.source
    }

    /// Returns the package name.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.package)
    }
}

/// A catalog source as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    /// Identity of the source.
    #[serde(flatten)]
    pub key: SourceKey,
    /// Source type discriminator (`grpc`, `configmap`, ...).
    pub source_type: String,
    /// Registry service address (`host:port` or URL), if the source exposes one.
    #[serde(default)]
    pub address: Option<String>,
    /// Human readable name of the catalog.
    #[serde(default)]
    pub display_name: String,
    /// Publisher of the catalog.
    #[serde(default)]
    pub publisher: String,
}

impl CatalogSource {
    /// Creates a `grpc` catalog source reachable at `address`.
    #[must_use]
    pub fn grpc(key: SourceKey, address: impl Into<String>) -> Self {
        Self {
            key,
            source_type: SOURCE_TYPE_GRPC.to_string(),
            address: Some(address.into()),
            display_name: String::new(),
            publisher: String::new(),
        }
    }

    /// Sets the display name and publisher.
    #[must_use]
    pub fn with_display(
        mut self,
        display_name: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Self {
        self.display_name = display_name.into();
        self.publisher = publisher.into();
        self
    }
}

/// Lifecycle event for a catalog source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// The source was observed for the first time.
    Added(CatalogSource),
    /// The source changed (or was re-synced unchanged).
    Updated(CatalogSource),
    /// The source no longer exists.
    Deleted(SourceKey),
}

impl SourceEvent {
    /// Returns the key of the source the event is about.
    #[must_use]
    pub fn key(&self) -> &SourceKey {
        match self {
            Self::Added(source) | Self::Updated(source) => &source.key,
            Self::Deleted(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_display_as_paths() {
        let key = SourceKey::new("olm", "community");
        assert_eq!(key.to_string(), "olm/community");
        assert_eq!(CacheKey::new(key, "etcd").to_string(), "olm/community/etcd");
    }

    #[test]
    fn source_keys_order_by_namespace_then_name() {
        let mut keys = vec![
            SourceKey::new("b", "a"),
            SourceKey::new("a", "z"),
            SourceKey::new("a", "b"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                SourceKey::new("a", "b"),
                SourceKey::new("a", "z"),
                SourceKey::new("b", "a"),
            ]
        );
    }

    #[test]
    fn catalog_source_deserializes_flattened_key() {
        let source: CatalogSource = serde_json::from_str(
            r#"{"namespace":"olm","name":"community","sourceType":"grpc","address":"registry:50051"}"#,
        )
        .unwrap();
        assert_eq!(source.key, SourceKey::new("olm", "community"));
        assert_eq!(source.address.as_deref(), Some("registry:50051"));
        assert!(source.display_name.is_empty());
    }

    #[test]
    fn event_key_covers_every_variant() {
        let key = SourceKey::new("olm", "community");
        let source = CatalogSource::grpc(key.clone(), "registry:50051");
        assert_eq!(SourceEvent::Added(source.clone()).key(), &key);
        assert_eq!(SourceEvent::Updated(source).key(), &key);
        assert_eq!(SourceEvent::Deleted(key.clone()).key(), &key);
    }
}
