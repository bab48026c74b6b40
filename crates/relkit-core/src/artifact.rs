//! Artifact model and the shared build-graph tables.
//!
//! An [`Artifact`] is exactly one of an archive, a container image (or Helm
//! chart) or a static manifest. Discovery files describe artifacts with the
//! three-optional-field [`ArtifactDescriptor`] shape; conversion rejects any
//! descriptor that does not populate exactly one field.
//!
//! [`ArtifactsTable`] and [`ImageDigestsTable`] are the only state shared
//! across pipeline tasks. Both are insert/overwrite-by-key maps behind a lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// A tarball staged in the source bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveArtifact {
    pub source_s3_key: String,
    pub source_s3_prefix: String,
    pub artifact_path: PathBuf,
    pub release_name: String,
    pub release_s3_path: String,
    #[serde(default)]
    pub release_cdn_uri: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub arch: Vec<String>,
    #[serde(default)]
    pub git_tag: String,
    #[serde(default)]
    pub project_path: String,
    pub sourced_from_branch: String,
    /// `tarball` for regular archives; anything else is an OS image.
    #[serde(default = "default_image_format")]
    pub image_format: String,
}

fn default_image_format() -> String {
    "tarball".to_string()
}

impl ArchiveArtifact {
    pub fn source_key(&self) -> String {
        join_key(&self.source_s3_prefix, &self.source_s3_key)
    }

    pub fn release_key(&self) -> String {
        join_key(&self.release_s3_path, &self.release_name)
    }

    pub fn is_tarball(&self) -> bool {
        self.image_format == "tarball"
    }

    pub fn staged_source_path(&self) -> PathBuf {
        self.artifact_path.join(&self.source_s3_key)
    }

    pub fn staged_release_path(&self) -> PathBuf {
        self.artifact_path.join(&self.release_name)
    }
}

/// How an image artifact is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ImageKind {
    #[default]
    Container,
    HelmChart,
}

/// A container image (or OCI Helm chart) in the source registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    pub asset_name: String,
    pub source_image_uri: String,
    pub release_image_uri: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: Vec<String>,
    #[serde(default)]
    pub git_tag: String,
    #[serde(default)]
    pub project_path: String,
    pub sourced_from_branch: String,
    #[serde(default)]
    pub kind: ImageKind,
    /// `release_image_uri` is a base; the dev or production semver is
    /// appended to it before transfer.
    #[serde(default)]
    pub append_release_semver: bool,
    /// Drop the `v` after `:` once the semver is appended.
    #[serde(default)]
    pub trim_version_signifier: bool,
}

impl ImageArtifact {
    /// Tag of the release URI, the part after the last `:`.
    pub fn release_tag(&self) -> &str {
        self.release_image_uri
            .rsplit_once(':')
            .map(|(_, tag)| tag)
            .unwrap_or("")
    }

    /// Release URI without its tag.
    pub fn release_repository(&self) -> &str {
        self.release_image_uri
            .rsplit_once(':')
            .map(|(repo, _)| repo)
            .unwrap_or(&self.release_image_uri)
    }
}

/// An image reference rewritten inside a manifest before upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTagOverride {
    pub repository: String,
    pub release_uri: String,
}

/// A static YAML manifest staged in the source bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestArtifact {
    pub source_s3_key: String,
    pub source_s3_prefix: String,
    pub artifact_path: PathBuf,
    pub release_name: String,
    pub release_s3_path: String,
    #[serde(default)]
    pub release_cdn_uri: String,
    #[serde(default)]
    pub image_tag_overrides: Vec<ImageTagOverride>,
    #[serde(default)]
    pub git_tag: String,
    #[serde(default)]
    pub project_path: String,
    pub sourced_from_branch: String,
    #[serde(default)]
    pub component: String,
}

impl ManifestArtifact {
    pub fn source_key(&self) -> String {
        join_key(&self.source_s3_prefix, &self.source_s3_key)
    }

    pub fn release_key(&self) -> String {
        join_key(&self.release_s3_path, &self.release_name)
    }

    pub fn staged_source_path(&self) -> PathBuf {
        self.artifact_path.join(&self.source_s3_key)
    }

    pub fn staged_release_path(&self) -> PathBuf {
        self.artifact_path.join(&self.release_name)
    }
}

pub(crate) fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// One physical deliverable of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ArtifactDescriptor", into = "ArtifactDescriptor")]
pub enum Artifact {
    Archive(ArchiveArtifact),
    Image(ImageArtifact),
    Manifest(ManifestArtifact),
}

impl Artifact {
    /// Name used in logs and error chains.
    pub fn display_name(&self) -> &str {
        match self {
            Artifact::Archive(a) => &a.release_name,
            Artifact::Image(i) => &i.asset_name,
            Artifact::Manifest(m) => &m.release_name,
        }
    }

    pub fn sourced_from_branch(&self) -> &str {
        match self {
            Artifact::Archive(a) => &a.sourced_from_branch,
            Artifact::Image(i) => &i.sourced_from_branch,
            Artifact::Manifest(m) => &m.sourced_from_branch,
        }
    }

    pub fn as_image(&self) -> Option<&ImageArtifact> {
        match self {
            Artifact::Image(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_manifest(&self) -> Option<&ManifestArtifact> {
        match self {
            Artifact::Manifest(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_archive(&self) -> Option<&ArchiveArtifact> {
        match self {
            Artifact::Archive(a) => Some(a),
            _ => None,
        }
    }
}

/// Serialized shape of an artifact: exactly one field must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestArtifact>,
}

impl TryFrom<ArtifactDescriptor> for Artifact {
    type Error = ReleaseError;

    fn try_from(descriptor: ArtifactDescriptor) -> Result<Self> {
        match (descriptor.archive, descriptor.image, descriptor.manifest) {
            (Some(a), None, None) => Ok(Artifact::Archive(a)),
            (None, Some(i), None) => Ok(Artifact::Image(i)),
            (None, None, Some(m)) => Ok(Artifact::Manifest(m)),
            (None, None, None) => Err(ReleaseError::InvalidArtifact(
                "artifact has none of archive, image or manifest".to_string(),
            )),
            _ => Err(ReleaseError::InvalidArtifact(
                "artifact has more than one of archive, image or manifest".to_string(),
            )),
        }
    }
}

impl From<Artifact> for ArtifactDescriptor {
    fn from(artifact: Artifact) -> Self {
        match artifact {
            Artifact::Archive(a) => Self {
                archive: Some(a),
                ..Self::default()
            },
            Artifact::Image(i) => Self {
                image: Some(i),
                ..Self::default()
            },
            Artifact::Manifest(m) => Self {
                manifest: Some(m),
                ..Self::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery input
// ---------------------------------------------------------------------------

/// Artifacts discovered for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectArtifacts {
    pub name: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// Output of asset enumeration, one entry per project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryFile {
    #[serde(default)]
    pub projects: Vec<ProjectArtifacts>,
}

// ---------------------------------------------------------------------------
// ArtifactsTable
// ---------------------------------------------------------------------------

/// Project name → artifacts, in discovery order.
#[derive(Debug, Default)]
pub struct ArtifactsTable {
    inner: RwLock<HashMap<String, Vec<Artifact>>>,
}

impl ArtifactsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_discovery(discovery: DiscoveryFile) -> Self {
        let table = Self::new();
        for project in discovery.projects {
            table.store(project.name, project.artifacts);
        }
        table
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let discovery: DiscoveryFile = serde_yaml::from_str(yaml)?;
        Ok(Self::from_discovery(discovery))
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&yaml)
    }

    /// Insert or replace the artifact list of `name`.
    pub fn store(&self, name: impl Into<String>, artifacts: Vec<Artifact>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), artifacts);
    }

    pub fn load(&self, name: &str) -> Result<Vec<Artifact>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ReleaseError::ArtifactsNotFound {
                name: name.to_string(),
            })
    }

    /// Project names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Every artifact with its project name, projects sorted, discovery order within.
    pub fn entries(&self) -> Vec<(String, Artifact)> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();
        let entries: Vec<(String, Artifact)> = names
            .into_iter()
            .flat_map(|name| {
                guard[name]
                    .iter()
                    .map(move |artifact| (name.clone(), artifact.clone()))
            })
            .collect();
        entries
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// ImageDigestsTable
// ---------------------------------------------------------------------------

/// Release image URI → content digest.
#[derive(Debug, Default)]
pub struct ImageDigestsTable {
    inner: RwLock<HashMap<String, String>>,
}

impl ImageDigestsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, release_image_uri: impl Into<String>, digest: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(release_image_uri.into(), digest.into());
    }

    pub fn load(&self, release_image_uri: &str) -> Result<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(release_image_uri)
            .cloned()
            .ok_or_else(|| ReleaseError::DigestNotFound {
                image_uri: release_image_uri.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn descriptor_with_no_variant_rejected() {
        let err = Artifact::try_from(ArtifactDescriptor::default()).unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidArtifact(_)));
    }

    #[test]
    fn descriptor_with_two_variants_rejected() {
        let image = match image("a", "r/a:v1") {
            Artifact::Image(i) => i,
            _ => unreachable!(),
        };
        let dir = PathBuf::from("/tmp");
        let descriptor = ArtifactDescriptor {
            archive: Some(archive(&dir, "p", "a", "main")),
            image: Some(image),
            manifest: None,
        };
        let err = Artifact::try_from(descriptor).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn discovery_yaml_with_empty_artifact_fails() {
        let yaml = "projects:\n  - name: cilium\n    artifacts:\n      - {}\n";
        assert!(ArtifactsTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn discovery_yaml_loads_images() {
        let yaml = r#"
projects:
  - name: cluster-api
    artifacts:
      - image:
          assetName: cluster-api-controller
          sourceImageUri: src.example/cluster-api-controller:latest
          releaseImageUri: public.example/cluster-api-controller:v1.5.0-eks-a-1
          sourcedFromBranch: main
"#;
        let table = ArtifactsTable::from_yaml(yaml).unwrap();
        let artifacts = table.load("cluster-api").unwrap();
        let image = artifacts[0].as_image().unwrap();
        assert_eq!(image.kind, ImageKind::Container);
        assert_eq!(image.release_tag(), "v1.5.0-eks-a-1");
        assert_eq!(
            image.release_repository(),
            "public.example/cluster-api-controller"
        );
    }

    #[test]
    fn missing_project_is_fatal_with_name() {
        let table = ArtifactsTable::new();
        let err = table.load("cilium").unwrap_err();
        assert!(matches!(err, ReleaseError::ArtifactsNotFound { ref name } if name == "cilium"));
    }

    #[test]
    fn store_replaces_and_entries_are_sorted() {
        let table = ArtifactsTable::new();
        table.store("zeta", vec![image("z", "r/z:1")]);
        table.store("alpha", vec![image("a1", "r/a1:1"), image("a2", "r/a2:1")]);
        table.store("zeta", vec![image("z2", "r/z2:1")]);
        let names: Vec<String> = table
            .entries()
            .iter()
            .map(|(_, a)| a.display_name().to_string())
            .collect();
        assert_eq!(names, vec!["a1", "a2", "z2"]);
        assert_eq!(table.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn archive_keys_join_prefixes() {
        let a = archive(Path::new("/stage"), "etcdadm", "etcdadm", "main");
        assert_eq!(a.source_key(), "projects/etcdadm/latest/etcdadm-linux-amd64.tar.gz");
        assert_eq!(
            a.release_key(),
            "releases/bundles/1/artifacts/etcdadm/v1.0.0/etcdadm-v1.0.0-linux-amd64.tar.gz"
        );
        assert!(a.is_tarball());
    }

    #[test]
    fn digest_miss_names_uri() {
        let digests = ImageDigestsTable::new();
        digests.store("r/a:1", "sha256:aa");
        assert_eq!(digests.load("r/a:1").unwrap(), "sha256:aa");
        let err = digests.load("r/b:1").unwrap_err();
        assert!(err.to_string().contains("r/b:1"));
    }

    #[tokio::test]
    async fn concurrent_writers_are_all_visible() {
        let table = std::sync::Arc::new(ArtifactsTable::new());
        let mut set = tokio::task::JoinSet::new();
        for i in 0..16 {
            let table = std::sync::Arc::clone(&table);
            set.spawn(async move {
                table.store(format!("p{i:02}"), vec![image("a", "r/a:1")]);
            });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap();
        }
        assert_eq!(table.len(), 16);
    }
}
