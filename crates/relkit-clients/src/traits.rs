//! Collaborator trait definitions for relkit
//!
//! These traits define the external capabilities the release pipeline consumes:
//! - `ObjectStore`: bucket/key object storage (existence, download, upload)
//! - `ContainerRegistry`: digest lookup by tag
//! - `ImageMirror`: registry-to-registry image copy preserving multi-arch indexes
//! - `ChartTool`: Helm OCI pull/package/push
//! - `SourceControl`: checkout, describe, head and branch of a local working copy
//! - `Signer`: asymmetric signature over a precomputed SHA-256 digest
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Eventually consistent object storage.
///
/// `key_exists` may lag a completed upload; callers wrap probes in a retrier.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `key` is currently visible in `bucket`.
    async fn key_exists(&self, bucket: &str, key: &str) -> ClientResult<bool>;

    /// Download `bucket/key` to the local file `path`, creating parent directories.
    async fn download_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()>;

    /// Upload the local file `path` to `bucket/key` with public-read visibility.
    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Username/password pair for a container registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode an authorization token of the form `base64("user:pass")`.
    pub fn from_auth_token(token: &str) -> ClientResult<Self> {
        let decoded = STANDARD.decode(token.trim())?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| ClientError::InvalidCredentials(e.to_string()))?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            ClientError::InvalidCredentials("token is not a user:password pair".to_string())
        })?;
        Ok(Self::new(username, password))
    }

    /// `user:pass` form used by skopeo `--src-creds`/`--dest-creds`.
    pub fn as_pair(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Digest lookup against one registry.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Resolve the content digest (`sha256:<hex>`) of `image_uri` (`host/repo:tag`).
    async fn image_digest(&self, image_uri: &str) -> ClientResult<String>;
}

/// Registry-to-registry copy that preserves multi-arch manifests.
#[async_trait]
pub trait ImageMirror: Send + Sync {
    async fn copy_image(&self, source_uri: &str, dest_uri: &str) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// ChartTool
// ---------------------------------------------------------------------------

/// Helm OCI chart operations.
#[async_trait]
pub trait ChartTool: Send + Sync {
    /// Pull `chart_ref` (`host/repo/name`) at `version` and unpack it under
    /// `work_dir`. Returns the unpacked chart directory.
    async fn pull(&self, chart_ref: &str, version: &str, work_dir: &Path) -> ClientResult<PathBuf>;

    /// Package `chart_dir` into a `.tgz` written to `out_dir`. Returns its path.
    async fn package(&self, chart_dir: &Path, out_dir: &Path) -> ClientResult<PathBuf>;

    /// Push a packaged chart to the OCI `remote` (`host/repo`).
    async fn push(&self, package: &Path, remote: &str) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// SourceControl
// ---------------------------------------------------------------------------

/// Operations on a local working copy of a vendored project.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn checkout(&self, repo: &Path, branch: &str) -> ClientResult<()>;

    /// `git describe --tag` output, trimmed.
    async fn describe_tag(&self, repo: &Path) -> ClientResult<String>;

    async fn head(&self, repo: &Path) -> ClientResult<String>;

    async fn current_branch(&self, repo: &Path) -> ClientResult<String>;
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Key-management signing service.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign a precomputed SHA-256 `digest` with the key named `key_id`.
    async fn sign_digest(&self, digest: &[u8; 32], key_id: &str) -> ClientResult<Vec<u8>>;
}
