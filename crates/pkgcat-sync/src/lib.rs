//! # pkgcat-sync
//!
//! Catalog source synchronization engine for pkgcat.
//!
//! This crate keeps an in-memory cache of package manifests consistent with a
//! dynamic set of remote catalog sources:
//!
//! - **Registry**: The RPC contract of a catalog source, with HTTP and in-memory clients
//! - **Connections**: One monitored connection per catalog source
//! - **Builder**: Turns raw package/channel/bundle data into manifests, eliding bad channels
//! - **Cache**: Thread-safe manifest store with a per-source index
//! - **Synchronizer**: The control loop driving refresh and garbage collection
//! - **Query**: Namespace-scoped Get/List over the cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pkgcat_core::{CatalogSource, SourceEvent, SourceKey};
//! use pkgcat_sync::registry::http::HttpDialer;
//! use pkgcat_sync::{SyncConfig, Synchronizer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pkgcat_core::Result<()> {
//! let config = SyncConfig::from_env()?;
//! let sync = Arc::new(Synchronizer::new(config, Arc::new(HttpDialer::default())));
//!
//! let (events, rx) = tokio::sync::mpsc::channel(64);
//! let shutdown = CancellationToken::new();
//! let control = tokio::spawn(Arc::clone(&sync).run(rx, shutdown.clone()));
//!
//! let key = SourceKey::new("openshift-marketplace", "community-operators");
//! events.send(SourceEvent::Added(CatalogSource::grpc(key, "community:50051"))).await.ok();
//!
//! shutdown.cancel();
//! control.await.ok();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod cache;
pub mod config;
pub mod connection;
pub mod csv;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod selector;
pub mod synchronizer;

pub use cache::PackageCache;
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectivityObserver, ConnectivityState, StateChange};
pub use query::{PackageProvider, RegistryProvider, StaticProvider};
pub use selector::LabelSelector;
pub use synchronizer::{RefreshReport, Synchronizer};
