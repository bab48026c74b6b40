//! End-to-end release run.
//!
//! Stages run strictly in order and each returns only after all of its tasks
//! finished, so no stage ever reads half-written tables:
//!
//! 1. dev release version (dev releases only)
//! 2. release image URI resolution for images taking a release semver
//! 3. download, rename, upload
//! 4. image digests
//! 5. bundle assembly and signing
//! 6. bundle and release manifest publication, latest version bookkeeping

use std::path::PathBuf;
use std::sync::Arc;

use relkit_clients::{
    ChartTool, ContainerRegistry, ImageMirror, ObjectStore, Signer, SourceControl,
};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::artifact::{join_key, Artifact, ArtifactsTable};
use crate::bundle::assembly::read_supported_channels;
use crate::bundle::{BundleAssembler, BundleLayout, Bundles};
use crate::config::ReleaseConfig;
use crate::dev_release::DevReleaseReconciler;
use crate::digests::generate_image_digests_table;
use crate::error::{ReleaseError, Result, StageContext};
use crate::manifest_path::{manifest_filepath, ManifestKind, ManifestPathParams};
use crate::obs;
use crate::release_manifest::{Release, ReleaseManifest};
use crate::signing::sign_bundle;
use crate::transfer::{
    download_artifacts, rename_artifacts, run_stage, upload_artifacts, TransferContext,
};
use crate::version::GitTagReader;

/// Every external capability a release run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub source_store: Arc<dyn ObjectStore>,
    pub release_store: Arc<dyn ObjectStore>,
    pub source_registry: Arc<dyn ContainerRegistry>,
    pub release_registry: Arc<dyn ContainerRegistry>,
    pub mirror: Arc<dyn ImageMirror>,
    pub charts: Arc<dyn ChartTool>,
    pub source_control: Arc<dyn SourceControl>,
    pub signer: Arc<dyn Signer>,
}

/// What a finished run published.
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub run_id: String,
    pub release_version: String,
    pub bundle_key: String,
    pub bundle_path: PathBuf,
    pub bundles: Bundles,
}

pub struct ReleasePipeline {
    config: Arc<ReleaseConfig>,
    clients: Collaborators,
    table: Arc<ArtifactsTable>,
    layout: BundleLayout,
}

impl std::fmt::Debug for ReleasePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleasePipeline")
            .field("branch", &self.config.build_repo_branch)
            .field("dev_release", &self.config.dev_release)
            .field("dry_run", &self.config.dry_run)
            .field("projects", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl ReleasePipeline {
    pub fn new(
        config: ReleaseConfig,
        clients: Collaborators,
        table: ArtifactsTable,
        layout: BundleLayout,
    ) -> Self {
        Self {
            config: Arc::new(config),
            clients,
            table: Arc::new(table),
            layout,
        }
    }

    fn work_dir(&self) -> PathBuf {
        self.config.artifact_dir.join(".relkit")
    }

    fn reconciler(&self, config: Arc<ReleaseConfig>) -> DevReleaseReconciler {
        DevReleaseReconciler::new(
            config,
            Arc::clone(&self.clients.release_store),
            Arc::clone(&self.clients.source_registry),
            Arc::clone(&self.clients.release_registry),
            self.work_dir(),
        )
    }

    pub async fn run(self) -> Result<ReleaseOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(mut self, run_id: String) -> Result<ReleaseOutcome> {
        tokio::fs::create_dir_all(self.work_dir()).await?;

        if self.config.dev_release {
            let version = self
                .reconciler(Arc::clone(&self.config))
                .dev_release_version()
                .await
                .stage("dev-version", &self.config.build_repo_branch)?;
            self.config = Arc::new(self.config.with_release_version(version));
        }
        let config = Arc::clone(&self.config);
        info!(
            event = "release.started",
            version = %config.release_version,
            bundle_number = config.bundle_number,
            dry_run = config.dry_run,
        );

        let reconciler = self.reconciler(Arc::clone(&config));
        self.resolve_release_image_uris(&reconciler).await?;

        let git_tags = Arc::new(GitTagReader::new(
            Arc::clone(&self.clients.source_control),
            config.build_repo_source.clone(),
        ));
        let transfer = Arc::new(TransferContext {
            config: Arc::clone(&config),
            table: Arc::clone(&self.table),
            source_store: Arc::clone(&self.clients.source_store),
            release_store: Arc::clone(&self.clients.release_store),
            mirror: Arc::clone(&self.clients.mirror),
            charts: Arc::clone(&self.clients.charts),
            git_tags: Arc::clone(&git_tags),
        });
        download_artifacts(Arc::clone(&transfer)).await?;
        rename_artifacts(Arc::clone(&transfer)).await?;
        upload_artifacts(transfer).await?;

        let digests = generate_image_digests_table(
            &self.table,
            Arc::clone(&self.clients.release_registry),
            config.dry_run,
        )
        .await?;

        let channels = read_supported_channels(&config.build_repo_source).await?;
        let assembler = BundleAssembler::new(
            Arc::clone(&config),
            Arc::clone(&self.table),
            Arc::new(digests),
            git_tags,
            std::mem::take(&mut self.layout),
        );
        let mut bundles = run_stage("assemble", self.table.len(), assembler.assemble(&channels)).await?;

        if !config.dry_run && !config.signing_key_id.is_empty() {
            sign_bundle(
                &mut bundles,
                self.clients.signer.as_ref(),
                &config.signing_key_id,
                &config.signing_excludes,
            )
            .await
            .stage("sign", &config.signing_key_id)?;
        }

        let uri_version = config.dev_release_uri_version();
        let params = ManifestPathParams::from_config(&config, &uri_version);
        let bundle_key = manifest_filepath(&params, ManifestKind::Bundles);
        let bundle_path = config.artifact_dir.join("bundle-release.yaml");
        tokio::fs::write(&bundle_path, bundles.to_yaml()?).await?;

        if !config.dry_run {
            self.clients
                .release_store
                .upload_file(&bundle_path, &config.release_bucket, &bundle_key)
                .await
                .stage("publish", &bundle_key)?;
            obs::emit_bundle_published(&config.release_bucket, &bundle_key, config.bundle_number);

            let release_key = manifest_filepath(&params, ManifestKind::Release);
            self.update_release_manifest(&release_key, &bundle_key)
                .await
                .stage("publish", &release_key)?;

            if config.dev_release && !config.weekly {
                reconciler
                    .put_release_version(&config.release_version)
                    .await
                    .stage("publish", "LATEST_RELEASE_VERSION")?;
            }
        }

        info!(event = "release.finished", version = %config.release_version, bundle_key = %bundle_key);
        Ok(ReleaseOutcome {
            run_id,
            release_version: config.release_version.clone(),
            bundle_key,
            bundle_path,
            bundles,
        })
    }

    /// Append the run's semver to image URIs that take one, and point
    /// manifest overrides of the same project at the new URIs.
    async fn resolve_release_image_uris(&self, reconciler: &DevReleaseReconciler) -> Result<()> {
        let names = self.table.names();
        run_stage("resolve-uris", names.len(), async {
            for name in names {
                let mut artifacts = self.table.load(&name)?;
                let mut renamed = Vec::new();
                for artifact in artifacts.iter_mut() {
                    let Artifact::Image(image) = artifact else {
                        continue;
                    };
                    if !image.append_release_semver {
                        continue;
                    }
                    let base = image.release_image_uri.clone();
                    let uri = reconciler
                        .release_image_uri(&base, &image.source_image_uri, image.trim_version_signifier)
                        .await
                        .stage("resolve-uris", &image.asset_name)?;
                    image.release_image_uri = uri.clone();
                    renamed.push((base, uri));
                }
                if renamed.is_empty() {
                    continue;
                }
                for artifact in artifacts.iter_mut() {
                    let Artifact::Manifest(manifest) = artifact else {
                        continue;
                    };
                    for tag_override in manifest.image_tag_overrides.iter_mut() {
                        if let Some((_, uri)) = renamed.iter().find(|(base, _)| *base == tag_override.release_uri) {
                            tag_override.release_uri = uri.clone();
                        }
                    }
                }
                self.table.store(name, artifacts);
            }
            Ok(())
        })
        .await
    }

    async fn update_release_manifest(&self, release_key: &str, bundle_key: &str) -> Result<()> {
        let config = &self.config;
        let store = &self.clients.release_store;
        let path = self.work_dir().join("eks-a-release.yaml");

        let mut manifest = if store.key_exists(&config.release_bucket, release_key).await? {
            store
                .download_file(&path, &config.release_bucket, release_key)
                .await?;
            ReleaseManifest::from_yaml(&tokio::fs::read_to_string(&path).await?)?
        } else {
            ReleaseManifest::default()
        };

        let git_commit = self
            .clients
            .source_control
            .head(&config.cli_repo_source)
            .await
            .map_err(|e| ReleaseError::Git(format!("reading cli repo head: {e}")))?;
        manifest.append_or_update_release(Release {
            date: config.release_date.clone(),
            version: config.release_version.clone(),
            number: config.bundle_number,
            git_commit,
            git_tag: config.release_version.clone(),
            bundle_manifest_url: join_key(&config.cdn, bundle_key),
        });
        manifest.spec.latest_version = config.release_version.clone();

        tokio::fs::write(&path, manifest.to_yaml()?).await?;
        store
            .upload_file(&path, &config.release_bucket, release_key)
            .await?;
        Ok(())
    }
}
