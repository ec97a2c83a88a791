//! Package manifest construction.
//!
//! [`build`] turns one package's declared channels into a [`PackageManifest`],
//! fetching the head bundle of every channel. Channels whose bundle cannot be
//! fetched or decoded are elided rather than failing the package; only a
//! package left without any channel fails.
//!
//! The provider and the architecture/OS labels come from the authoritative
//! channel: the declared default channel when it builds, otherwise the first
//! channel that builds.
//!
//! `build` holds no shared state and may run concurrently for many packages.

use std::collections::{BTreeMap, HashSet};

use pkgcat_core::manifest::labels;
use pkgcat_core::{
    CatalogSource, Error, PackageChannel, PackageManifest, PackageManifestStatus, Result,
};

use crate::csv::{ClusterServiceVersion, describe};
use crate::registry::{RawChannel, RawPackage, RegistryClient};

/// Builds the manifest for `package` as served by `source`.
///
/// # Errors
///
/// Returns [`Error::NoValidChannels`] if no declared channel could be built.
pub async fn build(
    source: &CatalogSource,
    package: &RawPackage,
    client: &dyn RegistryClient,
) -> Result<PackageManifest> {
    let declared_default = package.default_channel_name.as_str();

    let mut manifest = PackageManifest {
        name: package.name.clone(),
        namespace: source.key.namespace.clone(),
        labels: BTreeMap::from([
            (labels::CATALOG.to_string(), source.key.name.clone()),
            (labels::CATALOG_NAMESPACE.to_string(), source.key.namespace.clone()),
        ]),
        status: PackageManifestStatus {
            catalog_source: source.key.name.clone(),
            catalog_source_display_name: source.display_name.clone(),
            catalog_source_publisher: source.publisher.clone(),
            catalog_source_namespace: source.key.namespace.clone(),
            package_name: package.name.clone(),
            default_channel: declared_default.to_string(),
            ..PackageManifestStatus::default()
        },
    };

    let mut seen = HashSet::new();
    let mut default_elided = false;
    let mut has_authority = false;
    let mut authority_is_default = false;

    for channel in &package.channels {
        let is_default = channel.name == declared_default;
        if !seen.insert(channel.name.as_str()) {
            tracing::warn!(
                package = %package.name,
                channel = %channel.name,
                "duplicate channel declaration ignored"
            );
            continue;
        }

        let csv = match head_version(client, &package.name, channel).await {
            Ok(csv) => csv,
            Err(e) => {
                tracing::warn!(
                    package = %package.name,
                    channel = %channel.name,
                    error = %e,
                    "eliding channel: head bundle unavailable"
                );
                crate::metrics::record_channel_elided();
                default_elided |= is_default;
                continue;
            }
        };

        if !has_authority || (is_default && !authority_is_default) {
            apply_authority(&mut manifest, &csv);
            has_authority = true;
            authority_is_default = is_default;
        }

        manifest.status.channels.push(PackageChannel {
            name: channel.name.clone(),
            current_csv: channel.csv_name.clone(),
            current_csv_desc: describe(&csv),
        });
    }

    let Some(first) = manifest.status.channels.first() else {
        return Err(Error::NoValidChannels {
            package: package.name.clone(),
        });
    };

    if default_elided || manifest.default_channel().is_none() {
        let replacement = first.name.clone();
        tracing::debug!(
            package = %package.name,
            declared = %declared_default,
            replacement = %replacement,
            "default channel unavailable; using first remaining channel"
        );
        manifest.status.default_channel = replacement;
    }

    Ok(manifest)
}

async fn head_version(
    client: &dyn RegistryClient,
    package: &str,
    channel: &RawChannel,
) -> Result<ClusterServiceVersion> {
    let bundle = client.get_bundle_for_channel(package, &channel.name).await?;
    ClusterServiceVersion::from_json(&bundle.csv_json)
}

fn apply_authority(manifest: &mut PackageManifest, csv: &ClusterServiceVersion) {
    let provider = &csv.spec.provider;
    manifest.status.provider = provider.clone();
    manifest
        .labels
        .insert(labels::PROVIDER.to_string(), provider.name.clone());
    manifest
        .labels
        .insert(labels::PROVIDER_URL.to_string(), provider.url.clone());

    manifest.labels.retain(|key, _| {
        !key.starts_with(labels::ARCH_PREFIX) && !key.starts_with(labels::OS_PREFIX)
    });

    let mut has_arch = false;
    let mut has_os = false;
    for (key, value) in &csv.metadata.labels {
        if key.starts_with(labels::ARCH_PREFIX) {
            has_arch = true;
        } else if key.starts_with(labels::OS_PREFIX) {
            has_os = true;
        } else {
            continue;
        }
        manifest.labels.insert(key.clone(), value.clone());
    }
    if !has_arch {
        manifest
            .labels
            .insert(labels::DEFAULT_ARCH.to_string(), labels::SUPPORTED.to_string());
    }
    if !has_os {
        manifest
            .labels
            .insert(labels::DEFAULT_OS.to_string(), labels::SUPPORTED.to_string());
    }
}
