//! Local Ed25519 signer.
//!
//! Stands in for a key-management service when bundles are signed on a build
//! host. The key id passed to [`Signer::sign_digest`] must match the id this
//! signer was created with.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ClientError, ClientResult};
use crate::traits::Signer;

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

pub struct Ed25519Signer {
    key_id: String,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Build from a 32-byte seed encoded as hex.
    pub fn from_hex_seed(key_id: impl Into<String>, seed_hex: &str) -> ClientResult<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| ClientError::Signing(format!("invalid key seed: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::Signing("key seed must be 32 bytes".to_string()))?;
        Ok(Self {
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Fresh random key, for tests and throwaway dry runs.
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// SHA-256 fingerprint of the public key, hex encoded.
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.verifying_key())
    }
}

pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Parse a hex-encoded Ed25519 public key.
pub fn verifying_key_from_hex(public_hex: &str) -> ClientResult<VerifyingKey> {
    let bytes = hex::decode(public_hex.trim())
        .map_err(|e| ClientError::Signing(format!("invalid public key: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ClientError::Signing("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| ClientError::Signing(e.to_string()))
}

/// Check `signature` over `digest`.
pub fn verify_digest(key: &VerifyingKey, digest: &[u8; 32], signature: &[u8]) -> ClientResult<bool> {
    let signature = Signature::from_slice(signature)
        .map_err(|e| ClientError::Signing(format!("invalid signature: {e}")))?;
    Ok(key.verify(digest, &signature).is_ok())
}

#[async_trait]
impl Signer for Ed25519Signer {
    async fn sign_digest(&self, digest: &[u8; 32], key_id: &str) -> ClientResult<Vec<u8>> {
        if key_id != self.key_id {
            return Err(ClientError::Signing(format!(
                "unknown key id {key_id}, signer holds {}",
                self.key_id
            )));
        }
        Ok(self.signing_key.sign(digest).to_bytes().to_vec())
    }
}
