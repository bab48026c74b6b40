//! Component version computation.
//!
//! A component version is `<patch>+<checksum>`: the patch version comes from
//! the project's git tag, the checksum from the component's resolved image
//! digests and manifest hashes in a fixed order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relkit_clients::SourceControl;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ReleaseError, Result};

/// Checksum used for every component in dry runs.
pub const FAKE_COMPONENT_CHECKSUM: &str = "abcdef1";

const COMPONENT_CHECKSUM_LEN: usize = 7;

pub fn build_component_version(patch_version: &str, checksum: &str) -> String {
    format!("{patch_version}+{checksum}")
}

/// `hex(sha256(h1 || h2 || ... || hn))[..7]`, or the fixed dry-run checksum.
pub fn generate_component_hash<S: AsRef<str>>(hashes: &[S], dry_run: bool) -> String {
    if dry_run {
        return FAKE_COMPONENT_CHECKSUM.to_string();
    }
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_ref().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..COMPONENT_CHECKSUM_LEN].to_string()
}

/// Full sha256 hex of a staged manifest, or the fixed dry-run checksum.
pub async fn generate_manifest_hash(path: &Path, dry_run: bool) -> Result<String> {
    if dry_run {
        return Ok(FAKE_COMPONENT_CHECKSUM.to_string());
    }
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Deterministic stand-in for a sha256 or sha512 hex digest in dry runs.
pub fn fake_sha(bits: u32) -> String {
    match bits {
        512 => hex::encode(Sha512::digest(b"relkit dry run")),
        _ => hex::encode(Sha256::digest(b"relkit dry run")),
    }
}

/// Where a component's patch version comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum PatchVersionSource {
    /// `<build repo>/<project_path>/GIT_TAG` at the artifact's source branch.
    GitTagFile { project_path: String },
    /// `git describe --tag` in a vendored project, tag before the first `-`.
    DescribeTag { repo: PathBuf },
}

/// Reads git tags from the build repository.
///
/// Checkout and read happen under one lock so concurrent callers never see
/// each other's branch. A stale `.git/index.lock` is removed first.
pub struct GitTagReader {
    source_control: Arc<dyn SourceControl>,
    repo: PathBuf,
    lock: Mutex<()>,
}

impl GitTagReader {
    pub fn new(source_control: Arc<dyn SourceControl>, repo: impl Into<PathBuf>) -> Self {
        Self {
            source_control,
            repo: repo.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Remove a leftover `.git/index.lock` from an interrupted git process.
    pub async fn clean_index_lock(&self) -> Result<()> {
        let lock_file = self.repo.join(".git").join("index.lock");
        match tokio::fs::remove_file(&lock_file).await {
            Ok(()) => {
                debug!(path = %lock_file.display(), "removed stale git index lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Contents of `<project_path>/GIT_TAG` on `branch`, trimmed.
    pub async fn read_git_tag(&self, project_path: &str, branch: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        self.clean_index_lock().await?;

        let current = self.source_control.current_branch(&self.repo).await?;
        if current != branch {
            self.source_control
                .checkout(&self.repo, branch)
                .await
                .map_err(|e| ReleaseError::Git(format!("checking out {branch}: {e}")))?;
        }

        let path = self.repo.join(project_path).join("GIT_TAG");
        let tag = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ReleaseError::Git(format!("reading {}: {e}", path.display())))?;
        Ok(tag.trim().to_string())
    }

    /// Tag component of `git describe --tag` in `repo`.
    pub async fn describe_tag(&self, repo: &Path) -> Result<String> {
        let output = self.source_control.describe_tag(repo).await?;
        let tag = output.trim().split('-').next().unwrap_or_default();
        if tag.is_empty() {
            return Err(ReleaseError::InvalidVersion(format!(
                "git describe in {} returned no tag",
                repo.display()
            )));
        }
        Ok(tag.to_string())
    }

    pub async fn patch_version(&self, source: &PatchVersionSource, branch: &str) -> Result<String> {
        match source {
            PatchVersionSource::GitTagFile { project_path } => {
                self.read_git_tag(project_path, branch).await
            }
            PatchVersionSource::DescribeTag { repo } => self.describe_tag(repo).await,
        }
    }
}

impl std::fmt::Debug for GitTagReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitTagReader")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}
