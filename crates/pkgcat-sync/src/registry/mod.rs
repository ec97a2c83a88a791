//! Remote catalog registry contract.
//!
//! The [`RegistryClient`] trait is the RPC surface a catalog source exposes, and
//! [`RegistryDialer`] opens clients from a network address. Keeping both behind
//! traits separates transport from the synchronization logic:
//!
//! - **Testing**: Use [`memory::InMemoryRegistry`] and [`memory::InMemoryDialer`]
//! - **Production**: Use [`http::HttpRegistryClient`] via [`http::HttpDialer`]
//!
//! ## Listing semantics
//!
//! [`RegistryClient::list_packages`] returns a lazy stream. It is finite and not
//! restartable: a new call lists again from the start. An `Err` item ends the
//! listing; names received before it remain valid.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use pkgcat_core::Result;

use crate::connection::ConnectivityState;

/// Stream of package names produced by a listing.
pub type PackageNameStream = BoxStream<'static, Result<String>>;

/// A channel as declared by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChannel {
    /// Channel name.
    pub name: String,
    /// Name of the version at the head of the channel.
    #[serde(rename = "csvName")]
    pub csv_name: String,
}

/// A package as declared by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPackage {
    /// Package name.
    pub name: String,
    /// Declared channels, in catalog order.
    #[serde(default)]
    pub channels: Vec<RawChannel>,
    /// Declared default channel name.
    #[serde(default)]
    pub default_channel_name: String,
}

/// The head bundle of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Version metadata document (JSON).
    #[serde(rename = "csvJson")]
    pub csv_json: String,
    /// Related object documents (JSON).
    #[serde(default)]
    pub object: Vec<String>,
}

/// RPC surface of one catalog source.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; one client is shared by every task of a
/// refresh cycle.
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// Lists the names of every package in the catalog.
    ///
    /// Returns an error if the listing could not be started at all.
    async fn list_packages(&self) -> Result<PackageNameStream>;

    /// Fetches a package's declared channels and default channel.
    async fn get_package(&self, name: &str) -> Result<RawPackage>;

    /// Fetches the head bundle of one channel of a package.
    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle>;

    /// Checks whether the source is reachable.
    ///
    /// Returns [`ConnectivityState::Ready`], [`ConnectivityState::TransientFailure`]
    /// or [`ConnectivityState::Shutdown`]. Never fails: an unreachable source is a
    /// transient failure.
    async fn probe(&self) -> ConnectivityState;
}

/// Opens registry clients from network addresses.
#[async_trait]
pub trait RegistryDialer: Send + Sync + 'static {
    /// Opens a client for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`pkgcat_core::Error::Connection`] if the address is invalid or
    /// the client cannot be created.
    async fn dial(&self, address: &str) -> Result<Arc<dyn RegistryClient>>;
}
