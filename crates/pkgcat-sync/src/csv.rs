//! Version metadata documents and their public projection.
//!
//! Registries return each head version as a `ClusterServiceVersion` JSON
//! document. [`describe`] narrows a decoded document down to the public
//! [`CsvDescription`] fields stored in cached manifests. Unknown fields are
//! ignored and missing fields default, so only malformed JSON fails to decode.

use std::collections::BTreeMap;

use serde::Deserialize;

use pkgcat_core::{
    AppLink, CsvDescription, Icon, InstallMode, Maintainer, ProvidedApi, ProviderInfo, Result,
};

const DESCRIPTION_ANNOTATION: &str = "description";
const CAPABILITIES_ANNOTATION: &str = "capabilities";

/// A decoded version metadata document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterServiceVersion {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Version specification.
    pub spec: CsvSpec,
}

impl ClusterServiceVersion {
    /// Decodes a document from JSON.
    ///
    /// # Errors
    ///
    /// Returns a decode error if `json` is not a valid document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Object metadata of a version document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    /// Version name.
    pub name: String,
    /// Labels, including architecture and OS support labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Specification of a version document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct CsvSpec {
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub maintainers: Vec<Maintainer>,
    pub provider: ProviderInfo,
    pub links: Vec<AppLink>,
    pub icon: Vec<Icon>,
    pub maturity: String,
    pub min_kube_version: String,
    pub install_modes: Vec<InstallMode>,
    #[serde(rename = "customresourcedefinitions")]
    pub custom_resource_definitions: ApiDescriptions,
    #[serde(rename = "apiservicedefinitions")]
    pub api_service_definitions: ApiDescriptions,
    pub related_images: Vec<RelatedImage>,
}

/// Owned and required API descriptions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiDescriptions {
    /// APIs the version provides.
    pub owned: Vec<ApiDescription>,
    /// APIs the version depends on.
    pub required: Vec<ApiDescription>,
}

/// One API description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ApiDescription {
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub display_name: String,
    pub description: String,
}

/// An image referenced by a version.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelatedImage {
    /// Image role.
    pub name: String,
    /// Image reference.
    pub image: String,
}

/// Projects a version document onto its public description.
#[must_use]
pub fn describe(csv: &ClusterServiceVersion) -> CsvDescription {
    let spec = &csv.spec;
    let annotation = |key: &str| csv.metadata.annotations.get(key).cloned().unwrap_or_default();

    CsvDescription {
        display_name: spec.display_name.clone(),
        version: spec.version.clone(),
        provider: spec.provider.clone(),
        icon: spec.icon.clone(),
        description: annotation(DESCRIPTION_ANNOTATION),
        long_description: spec.description.clone(),
        keywords: spec.keywords.clone(),
        links: spec.links.clone(),
        maintainers: spec.maintainers.clone(),
        maturity: spec.maturity.clone(),
        capabilities: annotation(CAPABILITIES_ANNOTATION),
        min_kube_version: spec.min_kube_version.clone(),
        install_modes: spec.install_modes.clone(),
        provided_apis: spec
            .custom_resource_definitions
            .owned
            .iter()
            .chain(&spec.api_service_definitions.owned)
            .map(to_api)
            .collect(),
        required_apis: spec
            .custom_resource_definitions
            .required
            .iter()
            .chain(&spec.api_service_definitions.required)
            .map(to_api)
            .collect(),
        related_images: spec
            .related_images
            .iter()
            .map(|image| image.image.clone())
            .collect(),
    }
}

/// CRD names have the form `<plural>.<group>`; API services carry the group
/// explicitly.
fn to_api(description: &ApiDescription) -> ProvidedApi {
    let (plural, group) = match description.name.split_once('.') {
        Some((plural, group)) => (plural.to_string(), group.to_string()),
        None => (description.name.clone(), String::new()),
    };
    ProvidedApi {
        group: if description.group.is_empty() {
            group
        } else {
            description.group.clone()
        },
        version: description.version.clone(),
        kind: description.kind.clone(),
        plural,
        name: description.name.clone(),
        display_name: description.display_name.clone(),
        description: description.description.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn etcd_csv() -> ClusterServiceVersion {
        let doc = json!({
            "metadata": {
                "name": "etcdoperator.v0.9.4",
                "labels": { "operatorframework.io/arch.arm64": "supported" },
                "annotations": { "description": "Create and maintain etcd clusters", "capabilities": "Full Lifecycle" }
            },
            "spec": {
                "displayName": "etcd",
                "version": "0.9.4",
                "description": "A long description",
                "provider": { "name": "CNCF" },
                "customresourcedefinitions": {
                    "owned": [{ "name": "etcdclusters.etcd.database.coreos.com", "version": "v1beta2", "kind": "EtcdCluster" }],
                    "required": [{ "name": "backups.storage.example.com", "version": "v1", "kind": "Backup" }]
                },
                "apiservicedefinitions": {
                    "owned": [{ "name": "metrics", "group": "metrics.example.com", "version": "v1", "kind": "Metric" }]
                },
                "relatedImages": [{ "name": "operator", "image": "quay.io/coreos/etcd-operator:v0.9.4" }],
                "unknownField": true
            }
        });
        ClusterServiceVersion::from_json(&doc.to_string()).unwrap()
    }

    #[test]
    fn describe_projects_public_fields() {
        let desc = describe(&etcd_csv());
        assert_eq!(desc.display_name, "etcd");
        assert_eq!(desc.version, "0.9.4");
        assert_eq!(desc.provider.name, "CNCF");
        assert_eq!(desc.description, "Create and maintain etcd clusters");
        assert_eq!(desc.long_description, "A long description");
        assert_eq!(desc.capabilities, "Full Lifecycle");
        assert_eq!(desc.related_images, vec!["quay.io/coreos/etcd-operator:v0.9.4"]);
    }

    #[test]
    fn describe_splits_crd_names_into_plural_and_group() {
        let desc = describe(&etcd_csv());
        assert_eq!(desc.provided_apis.len(), 2);
        assert_eq!(desc.provided_apis[0].plural, "etcdclusters");
        assert_eq!(desc.provided_apis[0].group, "etcd.database.coreos.com");
        assert_eq!(desc.provided_apis[1].group, "metrics.example.com");
        assert_eq!(desc.required_apis[0].kind, "Backup");
    }

    #[test]
    fn malformed_documents_fail_to_decode() {
        assert!(ClusterServiceVersion::from_json("{\"spec\": ").is_err());
        assert!(ClusterServiceVersion::from_json("{\"spec\": {\"installModes\": 3}}").is_err());
    }
}
