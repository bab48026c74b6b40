//! Bundle assembly.
//!
//! A [`BundleLayout`] lists the components of a bundle. For every supported
//! Kubernetes channel, the assembler builds each component's bundle from the
//! artifacts table, the image digests table and the component's patch
//! version. Channel-scoped components look their projects up as
//! `<project>-<channel>`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Archive, BundleEntry, Bundles, ComponentBundle, Image, Manifest, VersionsBundle};
use crate::artifact::{
    join_key, ArchiveArtifact, Artifact, ArtifactsTable, ImageArtifact, ImageDigestsTable,
    ManifestArtifact,
};
use crate::config::ReleaseConfig;
use crate::error::{ReleaseError, Result};
use crate::version::{
    build_component_version, fake_sha, generate_component_hash, generate_manifest_hash,
    GitTagReader, PatchVersionSource,
};

/// Build-repo file listing supported release channels, one per line.
pub const SUPPORTED_RELEASE_BRANCHES: &str = "release/SUPPORTED_RELEASE_BRANCHES";

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// How one component bundle is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Key of the component in each versions bundle, e.g. `cilium`.
    pub key: String,
    /// Projects in the artifacts table contributing artifacts.
    pub projects: Vec<String>,
    /// Only artifacts with these names are used; empty means all.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Renames entries: artifact name → entry key.
    #[serde(default)]
    pub entry_keys: BTreeMap<String, String>,
    pub patch_version: PatchVersionSource,
    #[serde(default)]
    pub channel_scoped: bool,
}

impl ComponentSpec {
    fn selects(&self, artifact: &Artifact) -> bool {
        self.assets.is_empty() || self.assets.iter().any(|a| a == artifact_name(artifact))
    }

    fn entry_key(&self, artifact: &Artifact) -> String {
        let name = artifact_name(artifact);
        self.entry_keys
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn project_name(project: &str, channel: Option<&str>) -> String {
        match channel {
            Some(channel) => format!("{project}-{channel}"),
            None => project.to_string(),
        }
    }
}

/// Name an artifact is selected and keyed by.
fn artifact_name(artifact: &Artifact) -> &str {
    match artifact {
        Artifact::Image(image) => &image.asset_name,
        Artifact::Manifest(manifest) if !manifest.component.is_empty() => &manifest.component,
        Artifact::Manifest(manifest) => &manifest.release_name,
        Artifact::Archive(archive) => &archive.release_name,
    }
}

/// Components of a bundle, plus per-channel metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleLayout {
    pub components: Vec<ComponentSpec>,
    /// Channel (`1-28`) → end-of-standard-support date.
    #[serde(default)]
    pub end_of_standard_support: BTreeMap<String, String>,
}

impl BundleLayout {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&contents)
    }
}

/// Channels listed in the build repo, e.g. `["1-27", "1-28"]`.
pub async fn read_supported_channels(build_repo: &Path) -> Result<Vec<String>> {
    let path = build_repo.join(SUPPORTED_RELEASE_BRANCHES);
    let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
        ReleaseError::Config(format!("reading {}: {e}", path.display()))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// `1-28` → `1.28`.
pub fn kube_version(channel: &str) -> String {
    channel.replace('-', ".")
}

/// Hex digest from a `<hex>  <file name>` checksum file.
pub async fn read_sha_sums(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path).await?;
    let parts: Vec<&str> = contents.trim_end().split("  ").collect();
    match parts.as_slice() {
        [digest, _name] => Ok(digest.to_string()),
        _ => Err(ReleaseError::InvalidArtifact(format!(
            "checksum file {} is not in `<hex>  <name>` format",
            path.display()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// Folds component bundles into the Bundles document.
pub struct BundleAssembler {
    config: Arc<ReleaseConfig>,
    table: Arc<ArtifactsTable>,
    digests: Arc<ImageDigestsTable>,
    git_tags: Arc<GitTagReader>,
    layout: BundleLayout,
}

impl std::fmt::Debug for BundleAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleAssembler")
            .field("components", &self.layout.components.len())
            .finish_non_exhaustive()
    }
}

impl BundleAssembler {
    pub fn new(
        config: Arc<ReleaseConfig>,
        table: Arc<ArtifactsTable>,
        digests: Arc<ImageDigestsTable>,
        git_tags: Arc<GitTagReader>,
        layout: BundleLayout,
    ) -> Self {
        Self {
            config,
            table,
            digests,
            git_tags,
            layout,
        }
    }

    /// Build the unsigned Bundles document for `channels`.
    pub async fn assemble(&self, channels: &[String]) -> Result<Bundles> {
        let config = &self.config;
        let mut bundles = Bundles::new(
            config.bundle_number,
            config.release_time,
            &config.cli_min_version,
            &config.cli_max_version,
        );

        // Components shared by every channel are built once.
        let mut shared = BTreeMap::new();
        for spec in self.layout.components.iter().filter(|s| !s.channel_scoped) {
            let bundle = self
                .component_bundle(spec, None)
                .await
                .map_err(|e| ReleaseError::component(&spec.key, e))?;
            shared.insert(spec.key.clone(), bundle);
        }

        for channel in channels {
            let mut components = shared.clone();
            for spec in self.layout.components.iter().filter(|s| s.channel_scoped) {
                let bundle = self
                    .component_bundle(spec, Some(channel.as_str()))
                    .await
                    .map_err(|e| ReleaseError::component(&spec.key, e))?;
                components.insert(spec.key.clone(), bundle);
            }
            bundles.spec.versions_bundles.push(VersionsBundle {
                kube_version: kube_version(channel),
                end_of_standard_support: self.layout.end_of_standard_support.get(channel).cloned(),
                components,
            });
        }
        Ok(bundles)
    }

    /// Build one component's bundle, optionally for a single channel.
    pub async fn component_bundle(
        &self,
        spec: &ComponentSpec,
        channel: Option<&str>,
    ) -> Result<ComponentBundle> {
        let mut projects: Vec<String> = spec
            .projects
            .iter()
            .map(|p| ComponentSpec::project_name(p, channel))
            .collect();
        projects.sort();

        let mut artifacts = Vec::new();
        for project in &projects {
            artifacts.extend(
                self.table
                    .load(project)?
                    .into_iter()
                    .filter(|artifact| spec.selects(artifact)),
            );
        }
        if let Some(missing) = spec
            .assets
            .iter()
            .find(|asset| !artifacts.iter().any(|a| artifact_name(a) == asset.as_str()))
        {
            return Err(ReleaseError::AssetNotFound {
                asset: missing.clone(),
                projects: projects.join(", "),
            });
        }

        let mut entries = BTreeMap::new();
        let mut hashes = Vec::new();
        for artifact in &artifacts {
            let entry = match artifact {
                Artifact::Image(image) => {
                    let digest = self.digests.load(&image.release_image_uri)?;
                    hashes.push(digest.clone());
                    BundleEntry::Image(image_entry(image, digest))
                }
                Artifact::Manifest(manifest) => {
                    let hash =
                        generate_manifest_hash(&manifest.staged_release_path(), self.config.dry_run)
                            .await?;
                    hashes.push(hash);
                    BundleEntry::Manifest(self.manifest_entry(manifest))
                }
                Artifact::Archive(archive) => BundleEntry::Archive(self.archive_entry(archive).await?),
            };
            let key = spec.entry_key(artifact);
            if entries.contains_key(&key) {
                return Err(ReleaseError::DuplicateEntry { key });
            }
            entries.insert(key, entry);
        }

        let branch = artifacts
            .first()
            .map(Artifact::sourced_from_branch)
            .unwrap_or(self.config.build_repo_branch.as_str());
        let patch_version = self.git_tags.patch_version(&spec.patch_version, branch).await?;
        let checksum = generate_component_hash(&hashes, self.config.dry_run);
        let version = build_component_version(&patch_version, &checksum);
        debug!(component = %spec.key, channel = ?channel, version = %version, "component bundle built");

        Ok(ComponentBundle { version, entries })
    }

    fn release_uri(&self, cdn_uri: &str, key: String) -> String {
        if cdn_uri.is_empty() {
            join_key(&self.config.cdn, &key)
        } else {
            cdn_uri.to_string()
        }
    }

    fn manifest_entry(&self, manifest: &ManifestArtifact) -> Manifest {
        Manifest {
            uri: self.release_uri(&manifest.release_cdn_uri, manifest.release_key()),
        }
    }

    async fn archive_entry(&self, archive: &ArchiveArtifact) -> Result<Archive> {
        let (sha256, sha512) = if self.config.dry_run {
            (fake_sha(256), fake_sha(512))
        } else {
            let side_file = |ext: &str| {
                archive
                    .artifact_path
                    .join(format!("{}{ext}", archive.release_name))
            };
            (
                read_sha_sums(&side_file(".sha256")).await?,
                read_sha_sums(&side_file(".sha512")).await?,
            )
        };
        let description = if archive.os_name.is_empty() {
            format!("{} tarball", archive.release_name)
        } else {
            format!("{} {} image", archive.os_name, archive.image_format)
        };
        Ok(Archive {
            name: archive.release_name.clone(),
            description,
            os: archive.os.clone(),
            os_name: archive.os_name.clone(),
            arch: archive.arch.clone(),
            uri: self.release_uri(&archive.release_cdn_uri, archive.release_key()),
            sha256,
            sha512,
        })
    }
}

fn image_entry(image: &ImageArtifact, digest: String) -> Image {
    Image {
        name: image.asset_name.clone(),
        description: format!("Container image for {} image", image.asset_name),
        os: image.os.clone(),
        arch: image.arch.clone(),
        uri: image.release_image_uri.clone(),
        image_digest: digest,
    }
}
