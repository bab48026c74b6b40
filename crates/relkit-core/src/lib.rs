//! relkit Core Library
//!
//! Discovers, versions, transfers and signs the artifacts pinned by a
//! Bundles manifest.
//!
//! ## Key Components
//!
//! - `ArtifactsTable` / `ImageDigestsTable`: the shared build graph
//! - `Retrier`: bounded retry driven by a policy function
//! - `transfer`: download, rename and upload stages
//! - `DevReleaseReconciler`: dev build numbering and digest-based reuse
//! - `BundleAssembler` and `signing`: the Bundles document and its signature
//! - `ReleasePipeline`: the whole run, stage by stage

pub mod artifact;
pub mod bundle;
pub mod config;
pub mod dev_release;
pub mod digests;
pub mod error;
pub mod manifest_path;
pub mod obs;
pub mod pipeline;
pub mod release_manifest;
pub mod retrier;
pub mod signing;
pub mod telemetry;
pub mod transfer;
pub mod version;

pub use artifact::{
    ArchiveArtifact, Artifact, ArtifactDescriptor, ArtifactsTable, DiscoveryFile, ImageArtifact,
    ImageDigestsTable, ImageKind, ImageTagOverride, ManifestArtifact, ProjectArtifacts,
};
pub use bundle::{BundleAssembler, BundleLayout, Bundles, ComponentBundle, ComponentSpec, VersionsBundle};
pub use config::{ReleaseConfig, ReleaseConfigBuilder, ReleaseEnvironment, RetrySettings};
pub use dev_release::{new_build_number_from_last_version, DevReleaseReconciler};
pub use digests::generate_image_digests_table;
pub use error::{ReleaseError, Result, StageContext};
pub use manifest_path::{manifest_filepath, ManifestKind, ManifestPathParams};
pub use pipeline::{Collaborators, ReleaseOutcome, ReleasePipeline};
pub use release_manifest::{Release, ReleaseManifest};
pub use retrier::Retrier;
pub use signing::{sign_bundle, verify_bundle_signature};
pub use telemetry::init_tracing;
pub use version::{
    build_component_version, generate_component_hash, generate_manifest_hash, GitTagReader,
    PatchVersionSource,
};
