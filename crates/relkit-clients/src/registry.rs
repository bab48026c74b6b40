//! Container registry clients: HTTP digest lookup and skopeo-based mirroring.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::traits::{ContainerRegistry, ImageMirror, RegistryCredentials};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

/// A parsed `host/repository:tag` (or `host/repository@digest`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    pub fn parse(uri: &str) -> ClientResult<Self> {
        let uri = uri.trim_start_matches("docker://").trim_start_matches("oci://");
        let (registry, rest) = uri
            .split_once('/')
            .ok_or_else(|| ClientError::InvalidReference(uri.to_string()))?;

        let (repository, reference) = if let Some((repo, digest)) = rest.split_once('@') {
            (repo, digest)
        } else {
            match rest.rfind(':') {
                Some(idx) if !rest[idx..].contains('/') => (&rest[..idx], &rest[idx + 1..]),
                _ => (rest, "latest"),
            }
        };

        if registry.is_empty() || repository.is_empty() || reference.is_empty() {
            return Err(ClientError::InvalidReference(uri.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    /// URI without the tag, e.g. `public.ecr.aws/x/cilium`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

/// Digest lookup over the OCI distribution API.
pub struct HttpRegistry {
    client: reqwest::Client,
    credentials: Option<RegistryCredentials>,
    scheme: String,
}

impl HttpRegistry {
    pub fn new(credentials: Option<RegistryCredentials>) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relkit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            credentials,
            scheme: "https".to_string(),
        })
    }

    /// Talk plain HTTP (local test registries).
    pub fn insecure(mut self) -> Self {
        self.scheme = "http".to_string();
        self
    }

    fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, image.registry, image.repository, image.reference
        )
    }
}

#[async_trait]
impl ContainerRegistry for HttpRegistry {
    async fn image_digest(&self, image_uri: &str) -> ClientResult<String> {
        let image = ImageReference::parse(image_uri)?;
        let url = self.manifest_url(&image);
        debug!(image = %image_uri, url = %url, "resolving image digest");

        let mut request = self.client.get(&url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::ImageNotFound {
                uri: image_uri.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ClientError::Http(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        if let Some(digest) = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return Ok(digest.to_string());
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?;
        if String::from_utf8_lossy(&body).contains("MANIFEST_UNKNOWN") {
            return Err(ClientError::ImageNotFound {
                uri: image_uri.to_string(),
            });
        }
        debug!(image = %image_uri, media_type = %media_type, "digest header absent, hashing manifest body");
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&body))))
    }
}

/// Copies images with `skopeo copy --all`, keeping every platform of an index.
#[derive(Debug, Default, Clone)]
pub struct SkopeoMirror {
    source: Option<RegistryCredentials>,
    destination: Option<RegistryCredentials>,
}

impl SkopeoMirror {
    pub fn new(
        source: Option<RegistryCredentials>,
        destination: Option<RegistryCredentials>,
    ) -> Self {
        Self {
            source,
            destination,
        }
    }

    fn args(&self, source_uri: &str, dest_uri: &str) -> Vec<String> {
        let mut args = vec!["copy".to_string()];
        if let Some(creds) = &self.source {
            args.push("--src-creds".to_string());
            args.push(creds.as_pair());
        }
        if let Some(creds) = &self.destination {
            args.push("--dest-creds".to_string());
            args.push(creds.as_pair());
        }
        args.push(format!("docker://{source_uri}"));
        args.push(format!("docker://{dest_uri}"));
        args.extend(["-f", "oci", "--all"].map(String::from));
        args
    }
}

#[async_trait]
impl ImageMirror for SkopeoMirror {
    async fn copy_image(&self, source_uri: &str, dest_uri: &str) -> ClientResult<()> {
        info!(source = %source_uri, destination = %dest_uri, "copying image");
        let output = Command::new("skopeo")
            .args(self.args(source_uri, dest_uri))
            .output()
            .await
            .map_err(|e| ClientError::CommandFailed {
                command: "skopeo copy".to_string(),
                detail: format!("failed to run skopeo: {e}"),
            })?;

        if !output.status.success() {
            return Err(ClientError::CommandFailed {
                command: "skopeo copy".to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
