//! relkit - release bundle pipeline CLI
//!
//! ## Commands
//!
//! - `release`: run the full pipeline and publish a Bundles manifest
//! - `dev-version`: print the dev release version the next run would cut
//! - `manifest-path`: print the bundle and release manifest keys for a config
//! - `verify`: check a signed Bundles manifest against a public key

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use relkit_clients::{
    Ed25519Signer, FsObjectStore, GitCli, HelmCli, HttpRegistry, RegistryCredentials,
    SkopeoMirror,
};
use relkit_core::{
    manifest_filepath, verify_bundle_signature, ArtifactsTable, BundleLayout, Bundles,
    Collaborators, DevReleaseReconciler, ManifestKind, ManifestPathParams, ReleaseConfig,
    ReleaseEnvironment, ReleasePipeline,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "relkit")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release bundle pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, rename, upload, assemble, sign and publish a release
    Release {
        #[command(flatten)]
        config: ConfigArgs,

        /// Discovery file listing every project's artifacts (YAML)
        #[arg(long, env = "RELKIT_DISCOVERY_FILE")]
        discovery: PathBuf,

        /// Bundle layout file mapping projects to components (YAML)
        #[arg(long, env = "RELKIT_LAYOUT_FILE")]
        layout: PathBuf,

        /// Hex-encoded Ed25519 seed used to sign the bundle
        #[arg(long, env = "RELKIT_SIGNING_KEY_SEED", hide_env_values = true)]
        signing_key_seed: Option<String>,

        /// base64("user:pass") for the source registry
        #[arg(long, env = "RELKIT_SOURCE_REGISTRY_AUTH", hide_env_values = true)]
        source_registry_auth: Option<String>,

        /// base64("user:pass") for the release registry
        #[arg(long, env = "RELKIT_RELEASE_REGISTRY_AUTH", hide_env_values = true)]
        release_registry_auth: Option<String>,

        /// Talk plain HTTP to registries
        #[arg(long)]
        insecure_registries: bool,
    },

    /// Print the dev release version the next run on this branch would cut
    DevVersion {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the object keys of the bundle and release manifests
    ManifestPath {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Verify a signed Bundles manifest
    Verify {
        /// Path to the Bundles manifest (YAML)
        bundle: PathBuf,

        /// Hex-encoded Ed25519 public key
        #[arg(long)]
        public_key: String,
    },
}

/// Flags shared by every command that builds a release configuration.
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Root directory of the filesystem-backed buckets
    #[arg(long, env = "RELKIT_STORE_ROOT", default_value = ".relkit-store")]
    store_root: PathBuf,

    #[arg(long, env = "RELKIT_SOURCE_BUCKET")]
    source_bucket: String,

    #[arg(long, env = "RELKIT_RELEASE_BUCKET")]
    release_bucket: String,

    #[arg(long, env = "RELKIT_SOURCE_REGISTRY", default_value = "")]
    source_registry: String,

    #[arg(long, env = "RELKIT_RELEASE_REGISTRY")]
    release_registry: String,

    /// Checkout of the CLI repository
    #[arg(long, env = "RELKIT_CLI_REPO", default_value = "eks-anywhere")]
    cli_repo: PathBuf,

    #[arg(long, env = "RELKIT_CLI_REPO_BRANCH", default_value = "main")]
    cli_repo_branch: String,

    /// Checkout of the build tooling repository
    #[arg(long, env = "RELKIT_BUILD_REPO", default_value = "eks-anywhere-build-tooling")]
    build_repo: PathBuf,

    #[arg(long, env = "RELKIT_BUILD_REPO_BRANCH", default_value = "main")]
    build_repo_branch: String,

    /// Local staging directory for downloaded artifacts
    #[arg(long, env = "RELKIT_ARTIFACT_DIR", default_value = "downloaded-artifacts")]
    artifact_dir: PathBuf,

    #[arg(long, env = "RELKIT_CDN", default_value = "")]
    cdn: String,

    #[arg(long, env = "RELKIT_BUNDLE_NUMBER", default_value_t = 0)]
    bundle_number: u32,

    /// Base release version, e.g. v0.19.0
    #[arg(long, env = "RELKIT_RELEASE_VERSION", default_value = "vDev")]
    release_version: String,

    /// Release date (YYYY-MM-DD), defaults to today
    #[arg(long, env = "RELKIT_RELEASE_DATE")]
    release_date: Option<String>,

    /// Cut a production release instead of a dev release
    #[arg(long)]
    production: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    weekly: bool,

    /// development | production
    #[arg(long, env = "RELKIT_RELEASE_ENVIRONMENT", default_value = "development")]
    environment: String,

    #[arg(long, env = "RELKIT_CLI_MIN_VERSION", default_value = "v0.0.0")]
    cli_min_version: String,

    #[arg(long, env = "RELKIT_CLI_MAX_VERSION", default_value = "v0.0.0")]
    cli_max_version: String,

    /// Key id stamped on the bundle signature; signing is skipped when empty
    #[arg(long, env = "RELKIT_SIGNING_KEY_ID", default_value = "")]
    signing_key_id: String,

    /// base64 of newline-separated paths excluded from the signature
    #[arg(long, env = "RELKIT_SIGNING_EXCLUDES", default_value = "")]
    signing_excludes: String,
}

impl ConfigArgs {
    fn release_config(&self) -> Result<ReleaseConfig> {
        let environment: ReleaseEnvironment = self
            .environment
            .parse()
            .context("Invalid --environment")?;
        let mut builder = ReleaseConfig::builder()
            .with_buckets(&self.source_bucket, &self.release_bucket)
            .with_registries(&self.source_registry, &self.release_registry)
            .with_cli_repo(&self.cli_repo, &self.cli_repo_branch)
            .with_build_repo(&self.build_repo, &self.build_repo_branch)
            .with_artifact_dir(&self.artifact_dir)
            .with_cdn(&self.cdn)
            .with_bundle_number(self.bundle_number)
            .with_release_version(&self.release_version)
            .with_dev_release(!self.production)
            .with_dry_run(self.dry_run)
            .with_weekly(self.weekly)
            .with_release_environment(environment)
            .with_cli_version_range(&self.cli_min_version, &self.cli_max_version)
            .with_signing(&self.signing_key_id, &self.signing_excludes);
        if let Some(date) = &self.release_date {
            builder = builder.with_release_date(date);
        }
        builder.build().context("Invalid release configuration")
    }
}

#[derive(Debug, Serialize)]
struct ReleaseSummary {
    run_id: String,
    release_version: String,
    bundle_key: String,
    bundle_path: PathBuf,
    versions_bundles: usize,
    signed: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ManifestPaths {
    bundle: String,
    release: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    relkit_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Release {
            config,
            discovery,
            layout,
            signing_key_seed,
            source_registry_auth,
            release_registry_auth,
            insecure_registries,
        } => {
            let credentials = RegistryAuth {
                source: source_registry_auth,
                release: release_registry_auth,
                insecure: insecure_registries,
            };
            let summary = cmd_release(
                &config,
                &discovery,
                &layout,
                signing_key_seed.as_deref(),
                &credentials,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::DevVersion { config } => {
            println!("{}", cmd_dev_version(&config).await?);
            Ok(())
        }
        Commands::ManifestPath { config } => {
            let paths = cmd_manifest_path(&config)?;
            println!("{}", serde_json::to_string_pretty(&paths)?);
            Ok(())
        }
        Commands::Verify { bundle, public_key } => {
            if !cmd_verify(&bundle, &public_key).await? {
                bail!("Signature of {} does not verify", bundle.display());
            }
            println!("Signature OK");
            Ok(())
        }
    }
}

struct RegistryAuth {
    source: Option<String>,
    release: Option<String>,
    insecure: bool,
}

fn decode_auth(token: Option<&str>) -> Result<Option<RegistryCredentials>> {
    token
        .map(|t| RegistryCredentials::from_auth_token(t).context("Invalid registry auth token"))
        .transpose()
}

fn http_registry(creds: Option<RegistryCredentials>, insecure: bool) -> Result<HttpRegistry> {
    let registry = HttpRegistry::new(creds).context("Failed to build registry client")?;
    Ok(if insecure { registry.insecure() } else { registry })
}

fn signer(key_id: &str, seed: Option<&str>) -> Result<Ed25519Signer> {
    match seed {
        Some(seed) => {
            Ed25519Signer::from_hex_seed(key_id, seed).context("Invalid signing key seed")
        }
        None if key_id.is_empty() => Ok(Ed25519Signer::generate(key_id)),
        None => bail!("--signing-key-id {key_id} requires --signing-key-seed"),
    }
}

async fn cmd_release(
    args: &ConfigArgs,
    discovery: &Path,
    layout: &Path,
    signing_key_seed: Option<&str>,
    auth: &RegistryAuth,
) -> Result<ReleaseSummary> {
    let config = args.release_config()?;
    let table = ArtifactsTable::from_file(discovery)
        .await
        .with_context(|| format!("Failed to load discovery file {}", discovery.display()))?;
    let layout = BundleLayout::from_file(layout)
        .await
        .with_context(|| format!("Failed to load bundle layout {}", layout.display()))?;

    let store = Arc::new(FsObjectStore::new(&args.store_root).context("Failed to open store")?);
    let source_creds = decode_auth(auth.source.as_deref())?;
    let release_creds = decode_auth(auth.release.as_deref())?;
    let clients = Collaborators {
        source_store: store.clone(),
        release_store: store,
        source_registry: Arc::new(http_registry(source_creds.clone(), auth.insecure)?),
        release_registry: Arc::new(http_registry(release_creds.clone(), auth.insecure)?),
        mirror: Arc::new(SkopeoMirror::new(source_creds.clone(), release_creds.clone())),
        charts: Arc::new(HelmCli::new(source_creds, release_creds)),
        source_control: Arc::new(GitCli::new()),
        signer: Arc::new(signer(&config.signing_key_id, signing_key_seed)?),
    };

    info!(
        projects = table.len(),
        dev_release = config.dev_release,
        dry_run = config.dry_run,
        "Starting release"
    );
    let outcome = ReleasePipeline::new(config, clients, table, layout)
        .run()
        .await
        .context("Release failed")?;

    Ok(ReleaseSummary {
        signed: outcome
            .bundles
            .metadata
            .annotations
            .contains_key(relkit_core::signing::SIGNATURE_ANNOTATION),
        versions_bundles: outcome.bundles.spec.versions_bundles.len(),
        run_id: outcome.run_id,
        release_version: outcome.release_version,
        bundle_key: outcome.bundle_key,
        bundle_path: outcome.bundle_path,
    })
}

async fn cmd_dev_version(args: &ConfigArgs) -> Result<String> {
    let config = Arc::new(args.release_config()?);
    let store = Arc::new(FsObjectStore::new(&args.store_root).context("Failed to open store")?);
    let registry = Arc::new(http_registry(None, false)?);
    let work_dir = tempfile::tempdir().context("Failed to create work dir")?;
    let reconciler = DevReleaseReconciler::new(
        config,
        store,
        registry.clone(),
        registry,
        work_dir.path(),
    );
    reconciler
        .dev_release_version()
        .await
        .context("Failed to compute dev release version")
}

fn cmd_manifest_path(args: &ConfigArgs) -> Result<ManifestPaths> {
    let config = args.release_config()?;
    let uri_version = config.dev_release_uri_version();
    let params = ManifestPathParams::from_config(&config, &uri_version);
    Ok(ManifestPaths {
        bundle: manifest_filepath(&params, ManifestKind::Bundles),
        release: manifest_filepath(&params, ManifestKind::Release),
    })
}

async fn cmd_verify(bundle: &Path, public_key: &str) -> Result<bool> {
    let yaml = tokio::fs::read_to_string(bundle)
        .await
        .with_context(|| format!("Failed to read {}", bundle.display()))?;
    let bundles = Bundles::from_yaml(&yaml).context("Failed to parse Bundles manifest")?;
    verify_bundle_signature(&bundles, public_key).context("Failed to verify signature")
}
