//! Bundle signing and verification.
//!
//! The bundle is converted to JSON, volatile fields and configured exclusions
//! are deleted, and the canonical (sorted-key, compact) encoding is hashed
//! with SHA-256. The signer signs that digest; the base64 signature is stored
//! as an annotation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use relkit_clients::{verify_digest, verifying_key_from_hex, Signer};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::bundle::Bundles;
use crate::error::{ReleaseError, Result};
use crate::obs;

pub const EXCLUDES_ANNOTATION: &str = "anywhere.eks.amazonaws.com/excludes";
pub const SIGNATURE_ANNOTATION: &str = "anywhere.eks.amazonaws.com/signature";

/// Fields never covered by the signature.
pub const ALWAYS_EXCLUDED: [&str; 3] = [".status", ".metadata.creationTimestamp", ".metadata.annotations"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Each,
}

/// Parse a jq-style path such as `.spec.versionsBundles[].eksD`.
fn parse_path(path: &str) -> Result<Vec<Segment>> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix('.')
        .ok_or_else(|| ReleaseError::Signing(format!("exclude path {trimmed} must start with '.'")))?;

    let mut segments = Vec::new();
    for part in body.split('.') {
        let (key, each) = match part.strip_suffix("[]") {
            Some(key) => (key, true),
            None => (part, false),
        };
        if key.is_empty() || key.contains(['[', ']']) {
            return Err(ReleaseError::Signing(format!("unsupported exclude path {trimmed}")));
        }
        segments.push(Segment::Key(key.to_string()));
        if each {
            segments.push(Segment::Each);
        }
    }
    Ok(segments)
}

fn delete_path(value: &mut Value, segments: &[Segment]) {
    match segments {
        [] => {}
        [Segment::Key(key)] => {
            if let Some(map) = value.as_object_mut() {
                map.remove(key);
            }
        }
        [Segment::Each] => {
            if let Some(items) = value.as_array_mut() {
                items.clear();
            }
        }
        [Segment::Key(key), rest @ ..] => {
            if let Some(child) = value.get_mut(key.as_str()) {
                delete_path(child, rest);
            }
        }
        [Segment::Each, rest @ ..] => {
            if let Some(items) = value.as_array_mut() {
                for item in items {
                    delete_path(item, rest);
                }
            }
        }
    }
}

/// Decode the base64, newline-separated exclusion list.
pub fn decode_excludes(encoded: &str) -> Result<Vec<String>> {
    if encoded.trim().is_empty() {
        return Ok(Vec::new());
    }
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ReleaseError::Signing(format!("decoding excludes: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| ReleaseError::Signing(format!("excludes are not utf-8: {e}")))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// SHA-256 over the canonical JSON of `bundle` without the excluded fields.
pub fn bundle_digest(bundle: &Bundles, excludes: &[String]) -> Result<[u8; 32]> {
    let mut value = serde_json::to_value(bundle)?;
    let paths = ALWAYS_EXCLUDED
        .iter()
        .map(|p| p.to_string())
        .chain(excludes.iter().cloned());
    for path in paths {
        delete_path(&mut value, &parse_path(&path)?);
    }
    // serde_json maps are sorted by key.
    let canonical = serde_json::to_vec(&value)?;
    Ok(Sha256::digest(&canonical).into())
}

/// Sign `bundle` in place and return the base64 signature.
pub async fn sign_bundle(
    bundle: &mut Bundles,
    signer: &dyn Signer,
    key_id: &str,
    encoded_excludes: &str,
) -> Result<String> {
    let excludes = decode_excludes(encoded_excludes)?;
    bundle
        .metadata
        .annotations
        .insert(EXCLUDES_ANNOTATION.to_string(), encoded_excludes.to_string());

    let digest = bundle_digest(bundle, &excludes)?;
    let signature = STANDARD.encode(signer.sign_digest(&digest, key_id).await?);
    bundle
        .metadata
        .annotations
        .insert(SIGNATURE_ANNOTATION.to_string(), signature.clone());
    obs::emit_bundle_signed(key_id, ALWAYS_EXCLUDED.len() + excludes.len());
    Ok(signature)
}

/// Check the signature annotation against an Ed25519 public key (hex).
pub fn verify_bundle_signature(bundle: &Bundles, public_key_hex: &str) -> Result<bool> {
    let annotations = &bundle.metadata.annotations;
    let signature = annotations
        .get(SIGNATURE_ANNOTATION)
        .ok_or_else(|| ReleaseError::Signing("bundle has no signature annotation".to_string()))?;
    let signature = STANDARD
        .decode(signature)
        .map_err(|e| ReleaseError::Signing(format!("decoding signature: {e}")))?;
    let excludes = decode_excludes(annotations.get(EXCLUDES_ANNOTATION).map_or("", String::as_str))?;

    let digest = bundle_digest(bundle, &excludes)?;
    let key = verifying_key_from_hex(public_key_hex)?;
    Ok(verify_digest(&key, &digest, &signature)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ComponentBundle, VersionsBundle};
    use chrono::{TimeZone, Utc};
    use relkit_clients::fakes::FakeSigner;
    use relkit_clients::Ed25519Signer;

    fn bundle() -> Bundles {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut bundles = Bundles::new(7, created, "v0.19.0", "v0.19.99");
        let mut components = std::collections::BTreeMap::new();
        components.insert(
            "eksD".to_string(),
            ComponentBundle {
                version: "v1.28.3+abcdef1".to_string(),
                entries: Default::default(),
            },
        );
        bundles.spec.versions_bundles.push(VersionsBundle {
            kube_version: "1.28".to_string(),
            end_of_standard_support: None,
            components,
        });
        bundles
    }

    #[test]
    fn volatile_fields_do_not_change_the_digest() {
        let a = bundle();
        let mut b = bundle();
        b.metadata.creation_timestamp = None;
        b.metadata.annotations.insert("x".to_string(), "y".to_string());
        assert_eq!(bundle_digest(&a, &[]).unwrap(), bundle_digest(&b, &[]).unwrap());

        b.spec.number = 8;
        assert_ne!(bundle_digest(&a, &[]).unwrap(), bundle_digest(&b, &[]).unwrap());
    }

    #[test]
    fn excluded_array_paths_are_removed() {
        let a = bundle();
        let mut b = bundle();
        b.spec.versions_bundles[0]
            .components
            .get_mut("eksD")
            .unwrap()
            .version = "changed".to_string();
        let excludes = vec![".spec.versionsBundles[].eksD".to_string()];
        assert_eq!(
            bundle_digest(&a, &excludes).unwrap(),
            bundle_digest(&b, &excludes).unwrap()
        );
    }

    #[test]
    fn excludes_decode_from_base64_lines() {
        let encoded = STANDARD.encode(".spec.number\n\n.spec.versionsBundles[].eksD\n");
        assert_eq!(
            decode_excludes(&encoded).unwrap(),
            vec![".spec.number", ".spec.versionsBundles[].eksD"]
        );
        assert!(decode_excludes("").unwrap().is_empty());
        assert!(decode_excludes("***").is_err());
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(parse_path("spec.number").is_err());
        assert!(parse_path(".spec..number").is_err());
        assert!(parse_path(".spec.items[0]").is_err());
    }

    #[tokio::test]
    async fn sign_sets_annotations() {
        let signer = FakeSigner::new();
        let mut b = bundle();
        let encoded = STANDARD.encode(".spec.cliMaxVersion");
        let signature = sign_bundle(&mut b, &signer, "key-1", &encoded).await.unwrap();

        assert_eq!(b.metadata.annotations[EXCLUDES_ANNOTATION], encoded);
        assert_eq!(b.metadata.annotations[SIGNATURE_ANNOTATION], signature);
        let requests = signer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "key-1");
        assert_eq!(
            requests[0].1,
            bundle_digest(&bundle(), &[".spec.cliMaxVersion".to_string()]).unwrap()
        );
    }

    #[tokio::test]
    async fn ed25519_signature_verifies_until_tampered() {
        let signer = Ed25519Signer::generate("local");
        let public_hex = hex::encode(signer.verifying_key().as_bytes());
        let mut b = bundle();
        sign_bundle(&mut b, &signer, "local", "").await.unwrap();
        assert!(verify_bundle_signature(&b, &public_hex).unwrap());

        b.spec.cli_min_version = "v0.0.1".to_string();
        assert!(!verify_bundle_signature(&b, &public_hex).unwrap());
    }

    #[test]
    fn unsigned_bundle_fails_verification() {
        let err = verify_bundle_signature(&bundle(), &"00".repeat(32)).unwrap_err();
        assert!(err.to_string().contains("no signature annotation"));
    }
}
