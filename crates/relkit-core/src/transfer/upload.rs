//! Upload stage: publish archives, manifests and images to release locations.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::info;

use super::helm::publish_chart;
use super::{join_fail_fast, run_stage, TransferContext, CHECKSUM_EXTENSIONS};
use crate::artifact::{ArchiveArtifact, Artifact, ImageArtifact, ImageKind, ManifestArtifact};
use crate::config::HOOK_PROJECT_PATH;
use crate::error::{Result, StageContext};
use crate::obs;
use crate::retrier::Retrier;

const STAGE: &str = "upload";

/// Upload every artifact in the table. A dry run uploads nothing.
pub async fn upload_artifacts(ctx: Arc<TransferContext>) -> Result<()> {
    let entries = ctx.table.entries();
    run_stage(STAGE, entries.len(), async move {
        if ctx.config.dry_run {
            obs::emit_transfer_skipped(STAGE, "*", "dry run");
            return Ok(());
        }

        let mut set = JoinSet::new();
        for (_, artifact) in entries {
            let ctx = Arc::clone(&ctx);
            let name = artifact.display_name().to_string();
            set.spawn(async move {
                let result = match &artifact {
                    Artifact::Archive(archive) => upload_archive(&ctx, archive).await,
                    Artifact::Manifest(manifest) => upload_manifest(&ctx, manifest).await,
                    Artifact::Image(image) => upload_image(&ctx, image).await,
                };
                result.stage(STAGE, name)
            });
        }
        join_fail_fast(set).await?;
        Ok(())
    })
    .await
}

async fn put(ctx: &TransferContext, path: &Path, key: &str) -> Result<()> {
    info!(key = %key, bucket = %ctx.config.release_bucket, "uploading");
    ctx.release_store
        .upload_file(path, &ctx.config.release_bucket, key)
        .await?;
    Ok(())
}

async fn upload_archive(ctx: &TransferContext, archive: &ArchiveArtifact) -> Result<()> {
    let key = archive.release_key();
    put(ctx, &archive.staged_release_path(), &key).await?;
    if archive.project_path == HOOK_PROJECT_PATH {
        return Ok(());
    }
    for extension in CHECKSUM_EXTENSIONS {
        let path = archive
            .artifact_path
            .join(format!("{}{extension}", archive.release_name));
        put(ctx, &path, &format!("{key}{extension}")).await?;
    }
    Ok(())
}

async fn upload_manifest(ctx: &TransferContext, manifest: &ManifestArtifact) -> Result<()> {
    put(ctx, &manifest.staged_release_path(), &manifest.release_key()).await
}

/// Copy a container image or republish a chart. Either is retried as a whole
/// on failure; a chart retry pulls it afresh.
async fn upload_image(ctx: &TransferContext, image: &ImageArtifact) -> Result<()> {
    let retrier = Retrier::transient(ctx.config.transient_retry);
    retrier
        .retry(|| async move {
            match image.kind {
                ImageKind::HelmChart => publish_chart(ctx, image).await,
                ImageKind::Container => {
                    ctx.mirror
                        .copy_image(&image.source_image_uri, &image.release_image_uri)
                        .await?;
                    Ok(())
                }
            }
        })
        .await
}
