//! Release pipeline error taxonomy.
//!
//! Four families matter to callers: not-yet-propagated objects and images
//! (retried, then resolved by branch fallback), missing table entries (fatal,
//! never retried), transient transfer failures (retried by the generic
//! policy) and malformed version metadata (fatal).

use std::sync::OnceLock;

use regex::Regex;
use relkit_clients::ClientError;

/// Errors produced by the release pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("artifacts for project {name} not found in artifacts table")]
    ArtifactsNotFound { name: String },

    #[error("asset {asset} not found in projects {projects}")]
    AssetNotFound { asset: String, projects: String },

    #[error("entry {key} is produced by more than one artifact")]
    DuplicateEntry { key: String },

    #[error("digest for image {image_uri} not found in image digests table")]
    DigestNotFound { image_uri: String },

    #[error("requested object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("requested image not found: {uri}")]
    ImageNotFound { uri: String },

    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<ReleaseError>,
    },

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("{stage} [{subject}]: {source}")]
    Stage {
        stage: &'static str,
        subject: String,
        source: Box<ReleaseError>,
    },

    #[error("component {component}: {source}")]
    Component {
        component: String,
        source: Box<ReleaseError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("helm chart error: {0}")]
    Chart(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("task join error: {0}")]
    Join(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for release pipeline operations.
pub type Result<T> = std::result::Result<T, ReleaseError>;

fn sentinel_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"requested (object|image) not found",
            r"manifest for .* not found: manifest unknown: Requested image not found",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

impl ReleaseError {
    /// Wrap `source` with the stage name and the artifact/component it concerns.
    pub fn stage(stage: &'static str, subject: impl Into<String>, source: ReleaseError) -> Self {
        ReleaseError::Stage {
            stage,
            subject: subject.into(),
            source: Box::new(source),
        }
    }

    pub fn component(component: impl Into<String>, source: ReleaseError) -> Self {
        ReleaseError::Component {
            component: component.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error reports an object or image that is not (yet) visible.
    pub fn is_not_found(&self) -> bool {
        match self {
            ReleaseError::ObjectNotFound { .. } | ReleaseError::ImageNotFound { .. } => true,
            ReleaseError::Client(e) if e.is_not_found() => true,
            other => {
                let message = other.to_string();
                sentinel_patterns().iter().any(|re| re.is_match(&message))
            }
        }
    }
}

/// Attach stage context to any fallible result.
pub trait StageContext<T> {
    fn stage(self, stage: &'static str, subject: impl Into<String>) -> Result<T>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<ReleaseError>,
{
    fn stage(self, stage: &'static str, subject: impl Into<String>) -> Result<T> {
        self.map_err(|e| ReleaseError::stage(stage, subject, e.into()))
    }
}

impl From<tokio::task::JoinError> for ReleaseError {
    fn from(err: tokio::task::JoinError) -> Self {
        ReleaseError::Join(err.to_string())
    }
}
