//! Dev-release version bookkeeping and per-image semver reuse.
//!
//! Dev releases are cut often. An image whose source digest matches the one
//! published in the previous bundle keeps its previous dev semver; anything
//! else gets the next build number on its version line.

use std::path::PathBuf;
use std::sync::Arc;

use relkit_clients::{ContainerRegistry, ObjectStore};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::bundle::Bundles;
use crate::config::{ReleaseConfig, MAIN_BRANCH};
use crate::error::{ReleaseError, Result};
use crate::manifest_path::{
    latest_release_version_key, manifest_filepath, ManifestKind, ManifestPathParams,
};
use crate::obs;

const DEV_VERSION_PLACEHOLDER: &str = "vDev";
const BASE_DEV_VERSION: &str = "v0.0.0";
const DRY_RUN_PREVIOUS_SEMVER: &str = "v0.0.0-dev-build.0";

/// `vDev` and the empty version both mean `v0.0.0`.
pub fn normalize_release_version(release_version: &str) -> &str {
    if release_version.is_empty() || release_version == DEV_VERSION_PLACEHOLDER {
        BASE_DEV_VERSION
    } else {
        release_version
    }
}

/// Build number following `latest` on the `release_version` line.
///
/// A `latest` from another version line restarts the count at zero.
pub fn new_build_number_from_last_version(
    latest: &str,
    release_version: &str,
    branch: &str,
) -> Result<u64> {
    let release_version = normalize_release_version(release_version);
    if !latest.contains(release_version) && !latest.contains(DEV_VERSION_PLACEHOLDER) {
        debug!(latest, release_version, branch, "version line changed, resetting build number");
        return Ok(0);
    }

    let suffix = match latest.rfind('.') {
        Some(i) if i + 1 < latest.len() => &latest[i + 1..],
        _ => {
            return Err(ReleaseError::InvalidVersion(format!(
                "invalid dev release version found for latest release: {latest}"
            )))
        }
    };
    let last: u64 = suffix.parse().map_err(|e| {
        ReleaseError::InvalidVersion(format!(
            "invalid dev release version found for latest release [{latest}]: {e}"
        ))
    })?;
    Ok(last + 1)
}

/// `v0.0.0-dev+build.<date>` for weekly releases, `<version>-dev+build.<n>` otherwise.
pub fn current_dev_release_version(
    release_version: &str,
    weekly: bool,
    release_date: &str,
    build_number: u64,
) -> String {
    if weekly {
        format!("{BASE_DEV_VERSION}-dev+build.{release_date}")
    } else {
        format!(
            "{}-dev+build.{build_number}",
            normalize_release_version(release_version)
        )
    }
}

/// Dev semver embedded in a published release image URI.
///
/// The URI is `<repo>:<tag>-eks-a-<semver>`; on release branches the semver
/// carries the branch name, so the branch's own dashes are discounted.
pub fn semver_from_release_image_uri(uri: &str, branch: &str) -> Result<String> {
    let differential: i64 = if branch == MAIN_BRANCH { 1 } else { 2 };
    let split_index =
        uri.matches('-').count() as i64 - branch.matches('-').count() as i64 - differential;
    if split_index <= 0 {
        return Err(ReleaseError::InvalidVersion(format!(
            "no dev release semver in image uri {uri}"
        )));
    }
    Ok(uri
        .splitn(split_index as usize, '-')
        .last()
        .unwrap_or(uri)
        .to_string())
}

/// Reconciles dev release versions against what was published before.
pub struct DevReleaseReconciler {
    config: Arc<ReleaseConfig>,
    store: Arc<dyn ObjectStore>,
    source_registry: Arc<dyn ContainerRegistry>,
    release_registry: Arc<dyn ContainerRegistry>,
    work_dir: PathBuf,
    previous_bundle: OnceCell<Option<Bundles>>,
}

impl DevReleaseReconciler {
    pub fn new(
        config: Arc<ReleaseConfig>,
        store: Arc<dyn ObjectStore>,
        source_registry: Arc<dyn ContainerRegistry>,
        release_registry: Arc<dyn ContainerRegistry>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            store,
            source_registry,
            release_registry,
            work_dir: work_dir.into(),
            previous_bundle: OnceCell::new(),
        }
    }

    async fn read_release_object(&self, key: &str, file_name: &str) -> Result<Option<String>> {
        let bucket = &self.config.release_bucket;
        if !self.store.key_exists(bucket, key).await? {
            return Ok(None);
        }
        let path = self.work_dir.join(file_name);
        self.store.download_file(&path, bucket, key).await?;
        Ok(Some(tokio::fs::read_to_string(&path).await?))
    }

    async fn latest_release_version(&self) -> Result<Option<String>> {
        let key = latest_release_version_key(&self.config.build_repo_branch);
        Ok(self
            .read_release_object(&key, "latest-dev-release-version")
            .await?
            .map(|v| v.trim().to_string()))
    }

    /// Next build number for this branch, zero when nothing was released yet.
    pub async fn next_dev_build_number(&self) -> Result<u64> {
        match self.latest_release_version().await? {
            Some(latest) => new_build_number_from_last_version(
                &latest,
                &self.config.release_version,
                &self.config.build_repo_branch,
            ),
            None => Ok(0),
        }
    }

    /// Version of the dev release being cut.
    pub async fn dev_release_version(&self) -> Result<String> {
        let build_number = if self.config.weekly {
            0
        } else {
            self.next_dev_build_number().await?
        };
        let version = current_dev_release_version(
            &self.config.release_version,
            self.config.weekly,
            &self.config.release_date,
            build_number,
        );
        info!(event = "dev_release.version", version = %version, build_number);
        Ok(version)
    }

    /// Record `version` as the branch's latest dev release.
    pub async fn put_release_version(&self, version: &str) -> Result<()> {
        let key = latest_release_version_key(&self.config.build_repo_branch);
        let path = self.work_dir.join("LATEST_RELEASE_VERSION");
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(&path, version).await?;
        self.store
            .upload_file(&path, &self.config.release_bucket, &key)
            .await?;
        Ok(())
    }

    /// Key of the bundle published by the previous dev release of this branch.
    pub async fn previous_bundle_key(&self) -> Result<Option<String>> {
        let config = &self.config;
        if config.build_repo_branch == MAIN_BRANCH {
            let params = ManifestPathParams {
                weekly: false,
                ..ManifestPathParams::from_config(config, "")
            };
            return Ok(Some(manifest_filepath(&params, ManifestKind::Bundles)));
        }
        Ok(self.latest_release_version().await?.map(|latest| {
            format!(
                "{}/{}/bundles.yaml",
                config.build_repo_branch,
                latest.replace('+', "-")
            )
        }))
    }

    async fn previous_bundle(&self) -> Result<Option<&Bundles>> {
        let bundle = self
            .previous_bundle
            .get_or_try_init(|| async {
                let Some(key) = self.previous_bundle_key().await? else {
                    return Ok::<_, ReleaseError>(None);
                };
                match self.read_release_object(&key, "previous-bundle.yaml").await? {
                    Some(yaml) => Ok(Some(Bundles::from_yaml(&yaml)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(bundle.as_ref())
    }

    /// Dev semver the previous bundle published for images under `release_image_base`.
    pub async fn previous_release_image_semver(
        &self,
        release_image_base: &str,
    ) -> Result<Option<String>> {
        if self.config.dry_run {
            return Ok(Some(DRY_RUN_PREVIOUS_SEMVER.to_string()));
        }
        let Some(bundle) = self.previous_bundle().await? else {
            return Ok(None);
        };
        let mut semver = None;
        for image in bundle.images() {
            if image.uri.contains(release_image_base) {
                semver = Some(semver_from_release_image_uri(
                    &image.uri,
                    &self.config.build_repo_branch,
                )?);
            }
        }
        Ok(semver)
    }

    /// Whether the current source image is byte-identical to the previous release.
    pub async fn compare_digest_with_previous_bundle(
        &self,
        current_source_uri: &str,
        previous_release_uri: &str,
    ) -> Result<bool> {
        if self.config.dry_run {
            return Ok(false);
        }
        let current = self.source_registry.image_digest(current_source_uri).await?;
        let previous = self.release_registry.image_digest(previous_release_uri).await?;
        Ok(current == previous)
    }

    /// Semver suffix for a release image: reused, incremented, or the bundle number.
    pub async fn release_image_semver(
        &self,
        release_image_base: &str,
        current_source_uri: &str,
    ) -> Result<String> {
        let config = &self.config;
        if !config.dev_release {
            return Ok(config.bundle_number.to_string());
        }
        if config.weekly {
            return Ok(config.dev_release_uri_version());
        }

        let previous = match self.previous_release_image_semver(release_image_base).await? {
            Some(previous) if !previous.is_empty() => previous,
            _ => return Ok(config.dev_release_uri_version()),
        };

        let previous_uri = format!("{release_image_base}-{previous}");
        if self
            .compare_digest_with_previous_bundle(current_source_uri, &previous_uri)
            .await?
        {
            obs::emit_digest_reused(release_image_base, &previous);
            return Ok(previous);
        }

        let build_number = new_build_number_from_last_version(
            &previous,
            DEV_VERSION_PLACEHOLDER,
            &config.build_repo_branch,
        )?;
        let semver = current_dev_release_version(
            DEV_VERSION_PLACEHOLDER,
            false,
            &config.release_date,
            build_number,
        )
        .replace('+', "-");
        debug!(image = release_image_base, semver = %semver, "image changed, new dev semver");
        Ok(semver)
    }

    /// Full release URI: `<base>-<semver>`, optionally with `:v` trimmed to `:`.
    pub async fn release_image_uri(
        &self,
        release_image_base: &str,
        current_source_uri: &str,
        trim_version_signifier: bool,
    ) -> Result<String> {
        let semver = self
            .release_image_semver(release_image_base, current_source_uri)
            .await?;
        let uri = format!("{release_image_base}-{semver}");
        Ok(if trim_version_signifier {
            uri.replace(":v", ":")
        } else {
            uri
        })
    }
}

impl std::fmt::Debug for DevReleaseReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevReleaseReconciler")
            .field("branch", &self.config.build_repo_branch)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleEntry, ComponentBundle, Image, VersionsBundle};
    use chrono::Utc;
    use relkit_clients::fakes::{FakeRegistry, MemoryObjectStore};

    #[test]
    fn build_number_examples() {
        assert_eq!(
            new_build_number_from_last_version("v0.0.0-dev+build.5", "vDev", "main").unwrap(),
            6
        );
        assert_eq!(
            new_build_number_from_last_version("v0.0.0-dev+build.68", "v0.0.0", "main").unwrap(),
            69
        );
        assert_eq!(
            new_build_number_from_last_version("v0.0.0-dev+build.5", "v0.0.1", "main").unwrap(),
            0
        );
        assert_eq!(
            new_build_number_from_last_version("v0.0.0-dev-v1beta1+build.0", "v0.0.0", "v1beta1")
                .unwrap(),
            1
        );
    }

    #[test]
    fn malformed_latest_version_is_fatal() {
        let err = new_build_number_from_last_version("v0.0.0-dev+build.", "v0.0.0", "main")
            .unwrap_err();
        assert!(err.to_string().contains("v0.0.0-dev+build."));
        assert!(new_build_number_from_last_version("v0.0.0-dev+build.x", "v0.0.0", "main").is_err());
    }

    #[test]
    fn dev_version_formats() {
        assert_eq!(
            current_dev_release_version("vDev", false, "2024-05-06", 7),
            "v0.0.0-dev+build.7"
        );
        assert_eq!(
            current_dev_release_version("", false, "2024-05-06", 0),
            "v0.0.0-dev+build.0"
        );
        assert_eq!(
            current_dev_release_version("v0.19.0", true, "2024-05-06", 7),
            "v0.0.0-dev+build.2024-05-06"
        );
    }

    #[test]
    fn semver_extracted_from_uri() {
        let main = "public.example/cluster-api-controller:v1.5.2-eks-a-v0.0.0-dev-build.5";
        assert_eq!(
            semver_from_release_image_uri(main, "main").unwrap(),
            "v0.0.0-dev-build.5"
        );
        let branch =
            "public.example/cluster-api-controller:v1.5.2-eks-a-v0.0.0-dev-release-0.18-build.3";
        assert_eq!(
            semver_from_release_image_uri(branch, "release-0.18").unwrap(),
            "v0.0.0-dev-release-0.18-build.3"
        );
        assert!(semver_from_release_image_uri("r/a:v1", "main").is_err());
    }

    fn config(dry_run: bool) -> Arc<ReleaseConfig> {
        Arc::new(
            ReleaseConfig::builder()
                .with_buckets("source", "release")
                .with_registries("src.example", "public.example")
                .with_release_version("v0.0.0-dev+build.9")
                .with_dry_run(dry_run)
                .build()
                .unwrap(),
        )
    }

    fn previous_bundle_yaml(uri: &str) -> String {
        let mut bundles = Bundles::new(1, Utc::now(), "v0.0.0", "v0.0.0");
        let mut component = ComponentBundle {
            version: "v1.5.2+abcdef1".into(),
            ..ComponentBundle::default()
        };
        component.entries.insert(
            "controller".into(),
            BundleEntry::Image(Image {
                name: "cluster-api-controller".into(),
                description: String::new(),
                os: "linux".into(),
                arch: vec![],
                uri: uri.into(),
                image_digest: "sha256:old".into(),
            }),
        );
        let mut vb = VersionsBundle {
            kube_version: "1.28".into(),
            ..VersionsBundle::default()
        };
        vb.components.insert("clusterAPI".into(), component);
        bundles.spec.versions_bundles.push(vb);
        bundles.to_yaml().unwrap()
    }

    const BASE: &str = "public.example/cluster-api-controller:v1.5.2-eks-a";
    const SOURCE: &str = "src.example/cluster-api-controller:latest";

    #[tokio::test]
    async fn unchanged_digest_reuses_previous_semver() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(
            "release",
            "bundle-release.yaml",
            previous_bundle_yaml(&format!("{BASE}-v0.0.0-dev-build.5")),
        );
        let source = Arc::new(FakeRegistry::new().with_digest(SOURCE, "sha256:same"));
        let release = Arc::new(
            FakeRegistry::new().with_digest(&format!("{BASE}-v0.0.0-dev-build.5"), "sha256:same"),
        );
        let reconciler = DevReleaseReconciler::new(config(false), store, source, release, dir.path());
        assert_eq!(
            reconciler.release_image_semver(BASE, SOURCE).await.unwrap(),
            "v0.0.0-dev-build.5"
        );
    }

    #[tokio::test]
    async fn changed_digest_increments_build_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(
            "release",
            "bundle-release.yaml",
            previous_bundle_yaml(&format!("{BASE}-v0.0.0-dev-build.5")),
        );
        let source = Arc::new(FakeRegistry::new().with_digest(SOURCE, "sha256:new"));
        let release = Arc::new(
            FakeRegistry::new().with_digest(&format!("{BASE}-v0.0.0-dev-build.5"), "sha256:old"),
        );
        let reconciler = DevReleaseReconciler::new(config(false), store, source, release, dir.path());
        assert_eq!(
            reconciler.release_image_uri(BASE, SOURCE, false).await.unwrap(),
            format!("{BASE}-v0.0.0-dev-build.6")
        );
    }

    #[tokio::test]
    async fn no_previous_bundle_uses_current_uri_version() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = DevReleaseReconciler::new(
            config(false),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(FakeRegistry::new()),
            Arc::new(FakeRegistry::new()),
            dir.path(),
        );
        assert_eq!(
            reconciler.release_image_semver(BASE, SOURCE).await.unwrap(),
            "v0.0.0-dev-build.9"
        );
    }

    #[tokio::test]
    async fn dry_run_never_calls_registries() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeRegistry::new());
        let reconciler = DevReleaseReconciler::new(
            config(true),
            Arc::new(MemoryObjectStore::new()),
            source.clone(),
            Arc::new(FakeRegistry::new()),
            dir.path(),
        );
        assert_eq!(
            reconciler.release_image_semver(BASE, SOURCE).await.unwrap(),
            "v0.0.0-dev-build.1"
        );
        assert!(source.lookups().is_empty());
    }

    #[tokio::test]
    async fn build_number_from_latest_release_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let cfg = Arc::new(
            ReleaseConfig::builder()
                .with_buckets("source", "release")
                .with_registries("src.example", "public.example")
                .with_build_repo("build", "release-0.18")
                .with_release_version("v0.18.10")
                .build()
                .unwrap(),
        );
        store.put(
            "release",
            "release-0.18/LATEST_RELEASE_VERSION",
            "v0.18.10-dev+build.99",
        );
        let reconciler = DevReleaseReconciler::new(
            cfg,
            store.clone(),
            Arc::new(FakeRegistry::new()),
            Arc::new(FakeRegistry::new()),
            dir.path(),
        );
        assert_eq!(reconciler.next_dev_build_number().await.unwrap(), 100);
        let version = reconciler.dev_release_version().await.unwrap();
        assert_eq!(version, "v0.18.10-dev+build.100");
        assert_eq!(
            reconciler.previous_bundle_key().await.unwrap().unwrap(),
            "release-0.18/v0.18.10-dev-build.99/bundles.yaml"
        );

        reconciler.put_release_version(&version).await.unwrap();
        assert_eq!(
            store.get("release", "release-0.18/LATEST_RELEASE_VERSION").unwrap(),
            b"v0.18.10-dev+build.100".to_vec()
        );
    }

    #[tokio::test]
    async fn first_release_on_branch_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = DevReleaseReconciler::new(
            config(false),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(FakeRegistry::new()),
            Arc::new(FakeRegistry::new()),
            dir.path(),
        );
        assert_eq!(reconciler.next_dev_build_number().await.unwrap(), 0);
    }
}
