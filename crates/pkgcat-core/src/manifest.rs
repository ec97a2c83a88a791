//! Package manifest records.
//!
//! A [`PackageManifest`] describes one package offered by one catalog source:
//! its release channels and the version currently recommended in each.
//! Manifests are built by the sync engine, stored in the package cache and
//! served read-only to query callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known manifest label keys.
pub mod labels {
    /// Name of the catalog source that supplied the manifest.
    pub const CATALOG: &str = "catalog";
    /// Namespace of the catalog source that supplied the manifest.
    pub const CATALOG_NAMESPACE: &str = "catalog-namespace";
    /// Provider name of the package.
    pub const PROVIDER: &str = "provider";
    /// Provider URL of the package.
    pub const PROVIDER_URL: &str = "provider-url";
    /// Prefix of architecture support labels.
    pub const ARCH_PREFIX: &str = "operatorframework.io/arch.";
    /// Prefix of operating-system support labels.
    pub const OS_PREFIX: &str = "operatorframework.io/os.";
    /// Label value marking an architecture or OS as supported.
    pub const SUPPORTED: &str = "supported";
    /// Architecture assumed when a version declares none.
    pub const DEFAULT_ARCH: &str = "operatorframework.io/arch.amd64";
    /// Operating system assumed when a version declares none.
    pub const DEFAULT_OS: &str = "operatorframework.io/os.linux";
}

/// Cached, queryable record of one package from one catalog source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Package name.
    pub name: String,
    /// Namespace the manifest is visible in.
    pub namespace: String,
    /// Channel-independent labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Catalog-derived status.
    pub status: PackageManifestStatus,
}

impl PackageManifest {
    /// Returns the channel with the given name.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&PackageChannel> {
        self.status.channels.iter().find(|c| c.name == name)
    }

    /// Returns the channel `default_channel` refers to.
    #[must_use]
    pub fn default_channel(&self) -> Option<&PackageChannel> {
        self.channel(&self.status.default_channel)
    }

    /// Returns true if the manifest is complete: at least one channel and a
    /// default channel that names one of them.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.status.channels.is_empty() && self.default_channel().is_some()
    }
}

/// Status block of a [`PackageManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestStatus {
    /// Name of the catalog source that supplied the package.
    pub catalog_source: String,
    /// Display name of the catalog source.
    #[serde(default)]
    pub catalog_source_display_name: String,
    /// Publisher of the catalog source.
    #[serde(default)]
    pub catalog_source_publisher: String,
    /// Namespace of the catalog source.
    pub catalog_source_namespace: String,
    /// Provider of the package.
    #[serde(default)]
    pub provider: ProviderInfo,
    /// Package name as published by the catalog.
    pub package_name: String,
    /// Channels of the package. Never empty for cached manifests.
    pub channels: Vec<PackageChannel>,
    /// Name of the default channel; always present in `channels`.
    pub default_channel: String,
}

/// A named upgrade track within a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageChannel {
    /// Channel name, unique within its manifest.
    pub name: String,
    /// Name of the version at the head of the channel.
    #[serde(rename = "currentCSV")]
    pub current_csv: String,
    /// Public metadata of the head version.
    #[serde(rename = "currentCSVDesc")]
    pub current_csv_desc: CsvDescription,
}

/// Package provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name.
    #[serde(default)]
    pub name: String,
    /// Provider URL.
    #[serde(default)]
    pub url: String,
}

/// Public metadata of one version, projected from its full description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvDescription {
    /// Human readable name.
    pub display_name: String,
    /// Semantic version.
    pub version: String,
    /// Provider of the version.
    pub provider: ProviderInfo,
    /// Icons, as embedded data.
    #[serde(default)]
    pub icon: Vec<Icon>,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Long description.
    #[serde(default)]
    pub long_description: String,
    /// Search keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Related links.
    #[serde(default)]
    pub links: Vec<AppLink>,
    /// Maintainers.
    #[serde(default)]
    pub maintainers: Vec<Maintainer>,
    /// Maturity (`alpha`, `stable`, ...).
    #[serde(default)]
    pub maturity: String,
    /// Capability level annotation.
    #[serde(default)]
    pub capabilities: String,
    /// Minimum supported Kubernetes version.
    #[serde(default)]
    pub min_kube_version: String,
    /// Supported install modes.
    #[serde(default)]
    pub install_modes: Vec<InstallMode>,
    /// APIs owned by the version.
    #[serde(default)]
    pub provided_apis: Vec<ProvidedApi>,
    /// APIs the version depends on.
    #[serde(default)]
    pub required_apis: Vec<ProvidedApi>,
    /// Images the version references.
    #[serde(default)]
    pub related_images: Vec<String>,
}

/// An embedded icon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Icon {
    /// Base64 encoded image data.
    #[serde(rename = "base64data", default)]
    pub base64_data: String,
    /// Media type of the image.
    #[serde(rename = "mediatype", default)]
    pub media_type: String,
}

/// A named link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppLink {
    /// Link title.
    #[serde(default)]
    pub name: String,
    /// Link target.
    #[serde(default)]
    pub url: String,
}

/// A maintainer contact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Maintainer {
    /// Maintainer name.
    #[serde(default)]
    pub name: String,
    /// Maintainer email.
    #[serde(default)]
    pub email: String,
}

/// An install mode and whether it is supported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallMode {
    /// Install mode type (`OwnNamespace`, `AllNamespaces`, ...).
    #[serde(rename = "type")]
    pub mode_type: String,
    /// Whether the mode is supported.
    pub supported: bool,
}

/// An API provided or required by a version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedApi {
    /// API group.
    #[serde(default)]
    pub group: String,
    /// API version.
    #[serde(default)]
    pub version: String,
    /// Kind.
    #[serde(default)]
    pub kind: String,
    /// Plural resource name.
    #[serde(default)]
    pub plural: String,
    /// Full resource name.
    #[serde(default)]
    pub name: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}
