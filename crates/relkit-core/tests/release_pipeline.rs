use std::path::Path;
use std::sync::Arc;

use relkit_clients::fakes::{
    FakeChartTool, FakeImageMirror, FakeRegistry, FakeSigner, FakeSourceControl, MemoryObjectStore,
};
use relkit_clients::Ed25519Signer;
use relkit_core::{
    verify_bundle_signature, ArtifactsTable, BundleLayout, Bundles, Collaborators, ReleaseConfig,
    ReleaseManifest, ReleasePipeline, RetrySettings,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RESOLVED_URI: &str = "public.example/cilium/cilium:v1.13.2-eks-a-v0.0.0-dev-build.0";

struct World {
    build_repo: tempfile::TempDir,
    artifacts: tempfile::TempDir,
    store: Arc<MemoryObjectStore>,
    registry: Arc<FakeRegistry>,
    mirror: Arc<FakeImageMirror>,
}

impl World {
    fn new() -> Self {
        let build_repo = tempfile::tempdir().expect("build repo");
        std::fs::create_dir_all(build_repo.path().join("release")).expect("release dir");
        std::fs::write(
            build_repo.path().join("release/SUPPORTED_RELEASE_BRANCHES"),
            "1-28\n1-29\n",
        )
        .expect("channels");
        for (project, tag) in [("projects/cilium/cilium", "v1.13.2"), ("projects/etcdadm", "v1.0.0")] {
            let dir = build_repo.path().join(project);
            std::fs::create_dir_all(&dir).expect("project dir");
            std::fs::write(dir.join("GIT_TAG"), tag).expect("GIT_TAG");
        }

        let store = Arc::new(MemoryObjectStore::new());
        store.put("source", "projects/cilium/latest/manifests/cilium.yaml", manifest_body());
        store.put("source", "projects/etcdadm/latest/etcdadm-linux-amd64.tar.gz", b"tar".to_vec());
        store.put(
            "source",
            "projects/etcdadm/latest/etcdadm-linux-amd64.tar.gz.sha256",
            "aa11  etcdadm-linux-amd64.tar.gz\n",
        );
        store.put(
            "source",
            "projects/etcdadm/latest/etcdadm-linux-amd64.tar.gz.sha512",
            "bb22  etcdadm-linux-amd64.tar.gz\n",
        );

        Self {
            build_repo,
            artifacts: tempfile::tempdir().expect("artifact dir"),
            store,
            registry: Arc::new(FakeRegistry::new().with_digest(RESOLVED_URI, "sha256:c1c1")),
            mirror: Arc::new(FakeImageMirror::new()),
        }
    }

    fn discovery(&self) -> ArtifactsTable {
        let dir = self.artifacts.path().display();
        let yaml = format!(
            r#"
projects:
  - name: cilium
    artifacts:
      - image:
          assetName: cilium
          sourceImageUri: src.example/cilium/cilium:latest
          releaseImageUri: "public.example/cilium/cilium:v1.13.2-eks-a"
          os: linux
          arch: [amd64]
          sourcedFromBranch: main
          appendReleaseSemver: true
      - manifest:
          sourceS3Key: cilium.yaml
          sourceS3Prefix: projects/cilium/latest/manifests
          artifactPath: {dir}/cilium
          releaseName: cilium.yaml
          releaseS3Path: artifacts/cilium/v1.13.2
          sourcedFromBranch: main
          component: manifest
          imageTagOverrides:
            - repository: cilium/cilium
              releaseUri: "public.example/cilium/cilium:v1.13.2-eks-a"
  - name: etcdadm
    artifacts:
      - archive:
          sourceS3Key: etcdadm-linux-amd64.tar.gz
          sourceS3Prefix: projects/etcdadm/latest
          artifactPath: {dir}/etcdadm
          releaseName: etcdadm-v1.0.0-linux-amd64.tar.gz
          releaseS3Path: artifacts/etcdadm/v1.0.0
          os: linux
          arch: [amd64]
          projectPath: projects/etcdadm
          sourcedFromBranch: main
"#
        );
        ArtifactsTable::from_yaml(&yaml).expect("discovery")
    }

    fn layout() -> BundleLayout {
        BundleLayout::from_yaml(
            r#"
components:
  - key: cilium
    projects: [cilium]
    patchVersion:
      type: gitTagFile
      projectPath: projects/cilium/cilium
  - key: etcdadmBootstrap
    projects: [etcdadm]
    entryKeys:
      etcdadm-v1.0.0-linux-amd64.tar.gz: archive
    patchVersion:
      type: gitTagFile
      projectPath: projects/etcdadm
"#,
        )
        .expect("layout")
    }

    fn config(&self, dry_run: bool, signing_key: &str) -> ReleaseConfig {
        ReleaseConfig::builder()
            .with_buckets("source", "release")
            .with_registries("src.example", "public.example")
            .with_build_repo(self.build_repo.path(), "main")
            .with_cli_repo(self.build_repo.path(), "main")
            .with_artifact_dir(self.artifacts.path())
            .with_cdn("https://cdn.example")
            .with_bundle_number(12)
            .with_release_date("2024-03-01")
            .with_dry_run(dry_run)
            .with_signing(signing_key, "")
            .with_retry(RetrySettings::immediate(1), RetrySettings::immediate(1))
            .build()
            .expect("config")
    }

    fn pipeline(&self, dry_run: bool, signer: Arc<dyn relkit_clients::Signer>, key: &str) -> ReleasePipeline {
        let clients = Collaborators {
            source_store: self.store.clone(),
            release_store: self.store.clone(),
            source_registry: self.registry.clone(),
            release_registry: self.registry.clone(),
            mirror: self.mirror.clone(),
            charts: Arc::new(FakeChartTool::new()),
            source_control: Arc::new(FakeSourceControl::new("main")),
            signer,
        };
        ReleasePipeline::new(self.config(dry_run, key), clients, self.discovery(), Self::layout())
    }
}

fn manifest_body() -> Vec<u8> {
    b"spec:\n  image: src.example/cilium/cilium:v1.13.2-abc\n".to_vec()
}

fn read_release_object(store: &MemoryObjectStore, key: &str) -> String {
    String::from_utf8(store.get("release", key).expect(key)).expect("utf-8")
}

// ---------------------------------------------------------------------------
// Dev release on main
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dev_release_publishes_signed_bundle() {
    let world = World::new();
    let signer = Arc::new(Ed25519Signer::generate("local"));
    let public_hex = hex::encode(signer.verifying_key().as_bytes());

    let outcome = world
        .pipeline(false, signer, "local")
        .run()
        .await
        .expect("release run");

    assert_eq!(outcome.release_version, "v0.0.0-dev+build.0");
    assert_eq!(outcome.bundle_key, "bundle-release.yaml");

    let keys = world.store.uploaded_keys("release");
    for expected in [
        "LATEST_RELEASE_VERSION",
        "artifacts/cilium/v1.13.2/cilium.yaml",
        "artifacts/etcdadm/v1.0.0/etcdadm-v1.0.0-linux-amd64.tar.gz",
        "artifacts/etcdadm/v1.0.0/etcdadm-v1.0.0-linux-amd64.tar.gz.sha256",
        "artifacts/etcdadm/v1.0.0/etcdadm-v1.0.0-linux-amd64.tar.gz.sha512",
        "bundle-release.yaml",
        "eks-a-release.yaml",
    ] {
        assert!(keys.iter().any(|k| k == expected), "missing upload {expected}: {keys:?}");
    }

    // Image copied under its resolved dev URI, manifest retargeted to it.
    assert_eq!(
        world.mirror.copies(),
        vec![("src.example/cilium/cilium:latest".to_string(), RESOLVED_URI.to_string())]
    );
    let manifest = read_release_object(&world.store, "artifacts/cilium/v1.13.2/cilium.yaml");
    assert_eq!(manifest, format!("spec:\n  image: {RESOLVED_URI}\n"));

    let bundles = Bundles::from_yaml(&read_release_object(&world.store, "bundle-release.yaml"))
        .expect("bundle yaml");
    assert_eq!(bundles.spec.number, 12);
    let kube_versions: Vec<_> = bundles
        .spec
        .versions_bundles
        .iter()
        .map(|v| v.kube_version.as_str())
        .collect();
    assert_eq!(kube_versions, vec!["1.28", "1.29"]);
    let cilium = bundles.spec.versions_bundles[0].component("cilium").expect("cilium");
    assert_eq!(cilium.image("cilium").expect("image").image_digest, "sha256:c1c1");
    assert_eq!(
        cilium.manifest("manifest").expect("manifest").uri,
        "https://cdn.example/artifacts/cilium/v1.13.2/cilium.yaml"
    );
    let etcdadm = bundles.spec.versions_bundles[1]
        .component("etcdadmBootstrap")
        .expect("etcdadm");
    assert_eq!(etcdadm.archive("archive").expect("archive").sha512, "bb22");
    assert!(verify_bundle_signature(&bundles, &public_hex).expect("verify"));

    let release = ReleaseManifest::from_yaml(&read_release_object(&world.store, "eks-a-release.yaml"))
        .expect("release yaml");
    assert_eq!(release.spec.latest_version, "v0.0.0-dev+build.0");
    assert_eq!(
        release.spec.releases[0].bundle_manifest_url,
        "https://cdn.example/bundle-release.yaml"
    );
    assert_eq!(read_release_object(&world.store, "LATEST_RELEASE_VERSION"), "v0.0.0-dev+build.0");
}

#[tokio::test]
async fn second_dev_release_increments_build_number() {
    let world = World::new();
    world.store.put("release", "LATEST_RELEASE_VERSION", "v0.0.0-dev+build.4");

    // Resolved URI changes with the build number; a fresh registry answers for it.
    let outcome = World {
        registry: Arc::new(FakeRegistry::new().with_digest(
            "public.example/cilium/cilium:v1.13.2-eks-a-v0.0.0-dev-build.5",
            "sha256:c2c2",
        )),
        ..world
    }
    .pipeline(false, Arc::new(FakeSigner::new()), "")
    .run()
    .await
    .expect("release run");

    assert_eq!(outcome.release_version, "v0.0.0-dev+build.5");
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_publishes_nothing() {
    let world = World::new();
    let signer = Arc::new(FakeSigner::new());

    let outcome = world
        .pipeline(true, signer.clone(), "local")
        .run()
        .await
        .expect("dry run");

    assert!(world.store.uploaded_keys("release").is_empty());
    assert!(world.mirror.copies().is_empty());
    assert!(world.registry.lookups().is_empty());
    assert!(signer.requests().is_empty());

    let written = std::fs::read_to_string(&outcome.bundle_path).expect("bundle written locally");
    let bundles = Bundles::from_yaml(&written).expect("bundle yaml");
    let cilium = bundles.spec.versions_bundles[0].component("cilium").expect("cilium");
    assert_eq!(cilium.version, "v1.13.2+abcdef1");
    assert!(Path::new(&outcome.bundle_path).starts_with(world.artifacts.path()));
}
