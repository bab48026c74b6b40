//! Download stage.
//!
//! Every archive (with its checksum side files) and manifest is probed in the
//! source bucket through the not-found retrier before being downloaded. Off
//! the main line, a missing object falls back to the main-line artifact.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::info;

use super::{join_fail_fast, run_stage, TransferContext, CHECKSUM_EXTENSIONS};
use crate::artifact::{join_key, ArchiveArtifact, Artifact, ManifestArtifact};
use crate::config::{HOOK_PROJECT_PATH, MAIN_BRANCH};
use crate::error::{ReleaseError, Result, StageContext};
use crate::obs;
use crate::retrier::Retrier;

const STAGE: &str = "download";
const CLI_ARCHIVE_MARKER: &str = "eksctl-anywhere";

/// Download all archives and manifests in the artifacts table.
pub async fn download_artifacts(ctx: Arc<TransferContext>) -> Result<()> {
    let entries = ctx.table.entries();
    run_stage(STAGE, entries.len(), async move {
        ctx.git_tags.clean_index_lock().await?;

        let mut set = JoinSet::new();
        for (_, artifact) in entries {
            let ctx = Arc::clone(&ctx);
            match artifact {
                Artifact::Archive(archive) => {
                    if ctx.config.dry_run && !archive.is_tarball() {
                        obs::emit_transfer_skipped(STAGE, &archive.release_name, "os image in dry run");
                        continue;
                    }
                    set.spawn(async move {
                        let name = archive.release_name.clone();
                        download_archive(&ctx, &archive).await.stage(STAGE, name)
                    });
                }
                Artifact::Manifest(manifest) => {
                    set.spawn(async move {
                        let name = manifest.release_name.clone();
                        download_manifest(&ctx, &manifest).await.stage(STAGE, name)
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

/// A source object and what is needed to find its main-line equivalent.
struct SourceObject<'a> {
    prefix: &'a str,
    file_name: &'a str,
    project_path: &'a str,
    git_tag: &'a str,
}

async fn download_archive(ctx: &TransferContext, archive: &ArchiveArtifact) -> Result<()> {
    let object = SourceObject {
        prefix: &archive.source_s3_prefix,
        file_name: &archive.source_s3_key,
        project_path: &archive.project_path,
        git_tag: &archive.git_tag,
    };
    fetch(ctx, &object, &archive.staged_source_path()).await?;

    if archive.project_path == HOOK_PROJECT_PATH {
        return Ok(());
    }
    for extension in CHECKSUM_EXTENSIONS {
        let file_name = format!("{}{extension}", archive.source_s3_key);
        let checksum = SourceObject {
            file_name: &file_name,
            ..object
        };
        fetch(ctx, &checksum, &archive.artifact_path.join(&file_name)).await?;
    }
    Ok(())
}

async fn download_manifest(ctx: &TransferContext, manifest: &ManifestArtifact) -> Result<()> {
    let object = SourceObject {
        prefix: &manifest.source_s3_prefix,
        file_name: &manifest.source_s3_key,
        project_path: &manifest.project_path,
        git_tag: &manifest.git_tag,
    };
    fetch(ctx, &object, &manifest.staged_source_path()).await
}

/// Resolve the object's key (with fallback) and download it to `dest`.
async fn fetch(ctx: &TransferContext, object: &SourceObject<'_>, dest: &Path) -> Result<()> {
    let key = resolve_source_key(ctx, object).await?;
    info!(key = %key, dest = %dest.display(), "downloading source object");
    ctx.source_store
        .download_file(dest, &ctx.config.source_bucket, &key)
        .await?;
    Ok(())
}

async fn resolve_source_key(ctx: &TransferContext, object: &SourceObject<'_>) -> Result<String> {
    let config = &ctx.config;
    let key = join_key(object.prefix, object.file_name);
    let retrier = Retrier::not_found(&config.build_repo_branch, config.not_found_retry);

    let probe = retrier
        .retry(|| {
            let key = &key;
            let store = &ctx.source_store;
            async move {
                if store.key_exists(&config.source_bucket, key).await? {
                    Ok(())
                } else {
                    Err(ReleaseError::ObjectNotFound { key: key.clone() })
                }
            }
        })
        .await;

    match probe {
        Ok(()) => Ok(key),
        Err(_) if config.build_repo_branch != MAIN_BRANCH => {
            let prefix = main_line_prefix(ctx, object).await?;
            let fallback = join_key(&prefix, object.file_name);
            obs::emit_fallback_used(object.file_name, &key, &fallback);
            Ok(fallback)
        }
        Err(err) => Err(err),
    }
}

/// Source prefix of the main-line build of the same object.
///
/// The CLI archive only swaps its branch for `latest`; everything else also
/// swaps the project's branch tag for the tag on main.
async fn main_line_prefix(ctx: &TransferContext, object: &SourceObject<'_>) -> Result<String> {
    let config = &ctx.config;
    if object.file_name.contains(CLI_ARCHIVE_MARKER) {
        return Ok(object.prefix.replace(&config.cli_repo_branch, "latest"));
    }
    let main_tag = ctx
        .git_tags
        .read_git_tag(object.project_path, MAIN_BRANCH)
        .await?;
    let prefix = object.prefix.replace(&config.build_repo_branch, "latest");
    Ok(if object.git_tag.is_empty() {
        prefix
    } else {
        prefix.replace(object.git_tag, &main_tag)
    })
}
