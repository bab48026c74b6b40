//! Rename stage: staged source files become their release names.
//!
//! Manifests additionally have their source image references rewritten to
//! the release URIs listed in their tag overrides.

use std::path::Path;
use std::sync::Arc;

use regex::{NoExpand, Regex};
use tokio::task::JoinSet;
use tracing::debug;

use super::{join_fail_fast, run_stage, TransferContext, CHECKSUM_EXTENSIONS};
use crate::artifact::{ArchiveArtifact, Artifact, ManifestArtifact};
use crate::config::HOOK_PROJECT_PATH;
use crate::error::{ReleaseError, Result, StageContext};
use crate::obs;

const STAGE: &str = "rename";

/// Rename every downloaded archive and manifest.
pub async fn rename_artifacts(ctx: Arc<TransferContext>) -> Result<()> {
    let entries = ctx.table.entries();
    run_stage(STAGE, entries.len(), async move {
        let source_registry = ctx.config.source_container_registry.clone();
        let mut set = JoinSet::new();
        for (_, artifact) in entries {
            match artifact {
                Artifact::Archive(archive) => {
                    if ctx.config.dry_run && !archive.is_tarball() {
                        obs::emit_transfer_skipped(STAGE, &archive.release_name, "os image in dry run");
                        continue;
                    }
                    set.spawn(async move {
                        let name = archive.release_name.clone();
                        rename_archive(&archive).await.stage(STAGE, name)
                    });
                }
                Artifact::Manifest(manifest) => {
                    let source_registry = source_registry.clone();
                    set.spawn(async move {
                        let name = manifest.release_name.clone();
                        rename_manifest(&manifest, &source_registry)
                            .await
                            .stage(STAGE, name)
                    });
                }
                Artifact::Image(_) => {}
            }
        }
        join_fail_fast(set).await?;
        Ok(())
    })
    .await
}

async fn move_file(from: &Path, to: &Path) -> Result<()> {
    debug!(from = %from.display(), to = %to.display(), "renaming");
    tokio::fs::rename(from, to).await?;
    Ok(())
}

async fn rename_archive(archive: &ArchiveArtifact) -> Result<()> {
    move_file(&archive.staged_source_path(), &archive.staged_release_path()).await?;
    if archive.project_path == HOOK_PROJECT_PATH {
        return Ok(());
    }
    for extension in CHECKSUM_EXTENSIONS {
        let from = archive
            .artifact_path
            .join(format!("{}{extension}", archive.source_s3_key));
        let to = archive
            .artifact_path
            .join(format!("{}{extension}", archive.release_name));
        move_file(&from, &to).await?;
    }
    Ok(())
}

async fn rename_manifest(manifest: &ManifestArtifact, source_registry: &str) -> Result<()> {
    let staged = manifest.staged_release_path();
    move_file(&manifest.staged_source_path(), &staged).await?;
    if manifest.image_tag_overrides.is_empty() {
        return Ok(());
    }

    let mut contents = tokio::fs::read_to_string(&staged).await?;
    for tag_override in &manifest.image_tag_overrides {
        let pattern = format!(
            "{}.*",
            regex::escape(&format!("{source_registry}/{}", tag_override.repository))
        );
        let re = Regex::new(&pattern)
            .map_err(|e| ReleaseError::InvalidArtifact(format!("override pattern {pattern}: {e}")))?;
        contents = re
            .replace_all(&contents, NoExpand(&tag_override.release_uri))
            .into_owned();
    }
    tokio::fs::write(&staged, contents).await?;
    Ok(())
}
