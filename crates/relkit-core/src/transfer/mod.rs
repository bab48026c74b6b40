//! Artifact transfer: download, rename, upload.
//!
//! Each stage fans out one task per artifact on a `JoinSet` and returns once
//! every task finished. The first failure returns immediately; dropping the
//! set aborts the siblings still in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use relkit_clients::{ChartTool, ImageMirror, ObjectStore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::artifact::ArtifactsTable;
use crate::config::ReleaseConfig;
use crate::error::Result;
use crate::obs;
use crate::version::GitTagReader;

pub mod download;
pub mod helm;
pub mod rename;
pub mod upload;

pub use download::download_artifacts;
pub use rename::rename_artifacts;
pub use upload::upload_artifacts;

/// Checksum side files published next to every archive.
pub const CHECKSUM_EXTENSIONS: [&str; 2] = [".sha256", ".sha512"];

/// Collaborators and shared state used by the transfer stages.
#[derive(Clone)]
pub struct TransferContext {
    pub config: Arc<ReleaseConfig>,
    pub table: Arc<ArtifactsTable>,
    pub source_store: Arc<dyn ObjectStore>,
    pub release_store: Arc<dyn ObjectStore>,
    pub mirror: Arc<dyn ImageMirror>,
    pub charts: Arc<dyn ChartTool>,
    pub git_tags: Arc<GitTagReader>,
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("source_bucket", &self.config.source_bucket)
            .field("release_bucket", &self.config.release_bucket)
            .field("projects", &self.table.len())
            .finish_non_exhaustive()
    }
}

/// Drain `set`, returning on the first failed or panicked task.
pub(crate) async fn join_fail_fast<T: 'static>(mut set: JoinSet<Result<T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        results.push(joined??);
    }
    Ok(results)
}

/// Run `stage` inside its span, logging start and finish.
pub(crate) async fn run_stage<T, F>(name: &'static str, artifacts: usize, stage: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    async move {
        obs::emit_stage_started(name, artifacts);
        let result = stage.await;
        obs::emit_stage_finished(name, started.elapsed().as_millis() as u64, result.is_ok());
        result
    }
    .instrument(obs::stage_span(name))
    .await
}
