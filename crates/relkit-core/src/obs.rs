//! Structured lifecycle events for release runs.
//!
//! - `run_span` tagging everything a release run logs with its run id
//! - `stage_span` naming the running pipeline stage
//! - `emit_*` functions for stage boundaries and notable decisions

use tracing::{info, warn};

/// Span covering one whole release run.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("relkit.run", run_id = %run_id)
}

/// Span that async stages are instrumented with.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// download(ctx).instrument(stage_span("download")).await?;
/// // events inside carry stage = "download"
/// ```
pub fn stage_span(stage: &str) -> tracing::Span {
    tracing::info_span!("relkit.stage", stage = %stage)
}

pub fn emit_stage_started(stage: &str, artifacts: usize) {
    info!(event = "stage.started", stage = %stage, artifacts = artifacts);
}

pub fn emit_stage_finished(stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

/// A source object was missing and the main-line artifact was used instead.
pub fn emit_fallback_used(artifact: &str, original_key: &str, fallback_key: &str) {
    warn!(
        event = "download.fallback",
        artifact = %artifact,
        original_key = %original_key,
        fallback_key = %fallback_key,
    );
}

pub fn emit_digest_reused(release_image_base: &str, semver: &str) {
    info!(event = "dev_release.digest_reused", image = %release_image_base, semver = %semver);
}

pub fn emit_transfer_skipped(stage: &str, artifact: &str, reason: &str) {
    info!(event = "transfer.skipped", stage = %stage, artifact = %artifact, reason = %reason);
}

pub fn emit_bundle_published(bucket: &str, key: &str, number: u32) {
    info!(event = "bundle.published", bucket = %bucket, key = %key, number = number);
}

pub fn emit_bundle_signed(key_id: &str, excluded_paths: usize) {
    info!(event = "bundle.signed", key_id = %key_id, excluded_paths = excluded_paths);
}
