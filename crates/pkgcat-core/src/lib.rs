//! # pkgcat-core
//!
//! Core abstractions for the pkgcat package catalog aggregator.
//!
//! This crate provides the foundational types used across all pkgcat components:
//!
//! - **Source Identity**: [`SourceKey`] and [`CacheKey`] for catalog sources and cache entries
//! - **Lifecycle Events**: [`CatalogSource`] and [`SourceEvent`] delivered by discovery
//! - **Manifests**: [`PackageManifest`] and the channel/description records it carries
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `pkgcat-core` is the **only** crate allowed to define shared primitives.
//! The sync engine and the server binary exchange data exclusively through
//! the types defined here.
//!
//! ## Example
//!
//! ```rust
//! use pkgcat_core::prelude::*;
//!
//! let key = SourceKey::new("openshift-marketplace", "community-operators");
//! let cache_key = CacheKey::new(key.clone(), "etcd");
//! assert_eq!(cache_key.source(), &key);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod env;
pub mod error;
pub mod manifest;
pub mod observability;
pub mod source;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use pkgcat_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::manifest::{
        CsvDescription, PackageChannel, PackageManifest, PackageManifestStatus,
    };
    pub use crate::source::{CacheKey, CatalogSource, SourceEvent, SourceKey};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use manifest::{
    AppLink, CsvDescription, Icon, InstallMode, Maintainer, PackageChannel, PackageManifest,
    PackageManifestStatus, ProvidedApi, ProviderInfo, labels,
};
pub use observability::{LogFormat, init_logging};
pub use source::{CacheKey, CatalogSource, SourceEvent, SourceKey};
