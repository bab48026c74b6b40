//! The Bundles manifest document.
//!
//! One [`Bundles`] per release holds a [`VersionsBundle`] per supported
//! Kubernetes minor version. Each versions bundle maps component keys to a
//! [`ComponentBundle`]: a version plus named image, manifest or archive entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod assembly;

pub use assembly::{BundleAssembler, BundleLayout, ComponentSpec};

pub const API_VERSION: &str = "anywhere.eks.amazonaws.com/v1alpha1";
pub const BUNDLES_KIND: &str = "Bundles";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundles {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: BundlesSpec,
    #[serde(default)]
    pub status: BundlesStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlesSpec {
    pub number: u32,
    pub cli_min_version: String,
    pub cli_max_version: String,
    #[serde(default)]
    pub versions_bundles: Vec<VersionsBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BundlesStatus {}

impl Bundles {
    pub fn new(
        number: u32,
        created: DateTime<Utc>,
        cli_min_version: impl Into<String>,
        cli_max_version: impl Into<String>,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: BUNDLES_KIND.to_string(),
            metadata: ObjectMeta {
                name: format!("bundles-{number}"),
                creation_timestamp: Some(created),
                annotations: BTreeMap::new(),
            },
            spec: BundlesSpec {
                number,
                cli_min_version: cli_min_version.into(),
                cli_max_version: cli_max_version.into(),
                versions_bundles: Vec::new(),
            },
            status: BundlesStatus::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Every image entry across all versions bundles.
    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.spec
            .versions_bundles
            .iter()
            .flat_map(VersionsBundle::images)
    }
}

/// Components pinned for one Kubernetes minor version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsBundle {
    pub kube_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_standard_support: Option<String>,
    #[serde(flatten)]
    pub components: BTreeMap<String, ComponentBundle>,
}

impl VersionsBundle {
    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.components
            .values()
            .flat_map(|c| c.entries.values())
            .filter_map(|entry| match entry {
                BundleEntry::Image(image) => Some(image),
                _ => None,
            })
    }

    pub fn component(&self, key: &str) -> Option<&ComponentBundle> {
        self.components.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComponentBundle {
    pub version: String,
    #[serde(flatten)]
    pub entries: BTreeMap<String, BundleEntry>,
}

impl ComponentBundle {
    pub fn image(&self, key: &str) -> Option<&Image> {
        match self.entries.get(key) {
            Some(BundleEntry::Image(image)) => Some(image),
            _ => None,
        }
    }

    pub fn manifest(&self, key: &str) -> Option<&Manifest> {
        match self.entries.get(key) {
            Some(BundleEntry::Manifest(manifest)) => Some(manifest),
            _ => None,
        }
    }

    pub fn archive(&self, key: &str) -> Option<&Archive> {
        match self.entries.get(key) {
            Some(BundleEntry::Archive(archive)) => Some(archive),
            _ => None,
        }
    }
}

/// One named entry of a component bundle. Variants are told apart by their
/// required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleEntry {
    Archive(Archive),
    Image(Image),
    Manifest(Manifest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: Vec<String>,
    pub uri: String,
    pub image_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_name: String,
    #[serde(default)]
    pub arch: Vec<String>,
    pub uri: String,
    pub sha256: String,
    pub sha512: String,
}
