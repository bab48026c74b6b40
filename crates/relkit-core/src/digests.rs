//! Image digest collection.
//!
//! After upload, every release image URI is resolved to its manifest digest
//! in the release registry. A dry run records fake digests instead.

use std::sync::Arc;

use relkit_clients::ContainerRegistry;
use tokio::task::JoinSet;
use tracing::debug;

use crate::artifact::{Artifact, ArtifactsTable, ImageDigestsTable};
use crate::error::{ReleaseError, Result, StageContext};
use crate::transfer::{join_fail_fast, run_stage};
use crate::version::fake_sha;

const STAGE: &str = "digests";

/// Resolve the release digest of every image artifact in `table`.
pub async fn generate_image_digests_table(
    table: &ArtifactsTable,
    registry: Arc<dyn ContainerRegistry>,
    dry_run: bool,
) -> Result<ImageDigestsTable> {
    let images: Vec<_> = table
        .entries()
        .into_iter()
        .filter_map(|(_, artifact)| match artifact {
            Artifact::Image(image) => Some(image),
            _ => None,
        })
        .collect();

    run_stage(STAGE, images.len(), async move {
        let mut set = JoinSet::new();
        for image in images {
            let registry = Arc::clone(&registry);
            set.spawn(async move {
                let uri = image.release_image_uri;
                let digest = if dry_run {
                    format!("sha256:{}", fake_sha(256))
                } else {
                    registry.image_digest(&uri).await.stage(STAGE, uri.as_str())?
                };
                debug!(image = %uri, digest = %digest, "resolved image digest");
                Ok::<_, ReleaseError>((uri, digest))
            });
        }

        let digests = ImageDigestsTable::new();
        for (uri, digest) in join_fail_fast(set).await? {
            digests.store(uri, digest);
        }
        Ok(digests)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::image;
    use relkit_clients::fakes::FakeRegistry;

    fn table() -> ArtifactsTable {
        let table = ArtifactsTable::new();
        table.store(
            "cilium",
            vec![
                image("cilium", "public.example/cilium:v1.13.2-eks-a-9"),
                image("operator", "public.example/operator:v1.13.2-eks-a-9"),
            ],
        );
        table
    }

    #[tokio::test]
    async fn resolves_each_release_uri() {
        let registry = Arc::new(
            FakeRegistry::new()
                .with_digest("public.example/cilium:v1.13.2-eks-a-9", "sha256:111")
                .with_digest("public.example/operator:v1.13.2-eks-a-9", "sha256:222"),
        );
        let digests = generate_image_digests_table(&table(), registry.clone(), false)
            .await
            .unwrap();
        assert_eq!(digests.len(), 2);
        assert_eq!(
            digests.load("public.example/operator:v1.13.2-eks-a-9").unwrap(),
            "sha256:222"
        );
        assert_eq!(registry.lookups().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_uses_fake_digests() {
        let registry = Arc::new(FakeRegistry::new());
        let digests = generate_image_digests_table(&table(), registry.clone(), true)
            .await
            .unwrap();
        let digest = digests.load("public.example/cilium:v1.13.2-eks-a-9").unwrap();
        assert_eq!(digest, format!("sha256:{}", fake_sha(256)));
        assert!(registry.lookups().is_empty());
    }

    #[tokio::test]
    async fn missing_digest_fails_with_image_uri() {
        let registry = Arc::new(FakeRegistry::new());
        let err = generate_image_digests_table(&table(), registry, false)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("digests [public.example/"), "{err}");
    }
}
