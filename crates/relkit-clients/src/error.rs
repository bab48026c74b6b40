//! Error types for relkit-clients

use thiserror::Error;

/// Errors raised by the external collaborators (object storage, registries,
/// source control, chart tooling and signers).
#[derive(Error, Debug)]
pub enum ClientError {
    /// Object absent from the bucket
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Image or tag absent from the registry
    #[error("requested image not found: {uri}")]
    ImageNotFound { uri: String },

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// Malformed image reference
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// Registry authorization token could not be decoded
    #[error("invalid registry credentials: {0}")]
    InvalidCredentials(String),

    /// HTTP transport or status error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Signing key or signature problem
    #[error("signing failed: {0}")]
    Signing(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// True when the error reports a missing object or image.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::ObjectNotFound { .. } | ClientError::ImageNotFound { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err.to_string())
    }
}

impl From<base64::DecodeError> for ClientError {
    fn from(err: base64::DecodeError) -> Self {
        ClientError::InvalidCredentials(err.to_string())
    }
}

/// Result type for collaborator operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;
