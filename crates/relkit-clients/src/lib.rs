//! relkit-clients: external collaborators of the release pipeline
//!
//! The pipeline never talks to storage, registries, git, helm or a key
//! service directly. It consumes the traits in [`traits`], which this crate
//! implements for local and CLI-backed tooling.
//!
//! ## Key Components
//!
//! - `ObjectStore` / `FsObjectStore`: bucket/key storage
//! - `ContainerRegistry` / `HttpRegistry`: digest lookup over the distribution API
//! - `ImageMirror` / `SkopeoMirror`: multi-arch registry-to-registry copy
//! - `ChartTool` / `HelmCli`: Helm OCI pull, package and push
//! - `SourceControl` / `GitCli`: checkout, describe, head and branch queries
//! - `Signer` / `Ed25519Signer`: digest signing

mod error;
pub mod fakes;
pub mod fs_store;
pub mod git;
pub mod helm;
pub mod registry;
pub mod signer;
pub mod traits;

pub use error::{ClientError, ClientResult};
pub use fs_store::FsObjectStore;
pub use git::GitCli;
pub use helm::HelmCli;
pub use registry::{HttpRegistry, ImageReference, SkopeoMirror};
pub use signer::{verify_digest, verifying_key_from_hex, Ed25519Signer};
pub use traits::{
    ChartTool, ContainerRegistry, ImageMirror, ObjectStore, RegistryCredentials, Signer,
    SourceControl,
};
