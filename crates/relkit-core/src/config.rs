//! Immutable release configuration.
//!
//! A [`ReleaseConfig`] is assembled once with [`ReleaseConfig::builder`] and
//! then shared as `Arc<ReleaseConfig>` by every stage. Values that are only
//! known after the dev version has been computed are applied by deriving a
//! new config with [`ReleaseConfig::with_release_version`].

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};

/// Name of the default development line.
pub const MAIN_BRANCH: &str = "main";

/// Bucket key layout for projects without checksum side files.
pub const HOOK_PROJECT_PATH: &str = "projects/tinkerbell/hook";

/// Release environment the pipeline publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseEnvironment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for ReleaseEnvironment {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" => Ok(ReleaseEnvironment::Development),
            "production" => Ok(ReleaseEnvironment::Production),
            other => Err(ReleaseError::Config(format!(
                "unknown release environment '{other}'"
            ))),
        }
    }
}

/// Bounds for one retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts after which the policy declines.
    pub max_retries: u32,
    /// Wait between attempts.
    pub wait: Duration,
    /// Total time budget across all attempts.
    pub budget: Duration,
}

impl RetrySettings {
    /// Settings for probing objects that may not have propagated yet.
    pub fn not_found_default() -> Self {
        Self {
            max_retries: 60,
            wait: Duration::from_secs(30),
            budget: Duration::from_secs(60 * 60),
        }
    }

    /// Settings for transient transfer failures.
    pub fn transient_default() -> Self {
        Self {
            max_retries: 10,
            wait: Duration::from_secs(30),
            budget: Duration::from_secs(60 * 60),
        }
    }

    /// No waiting at all; used by tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            wait: Duration::ZERO,
            budget: Duration::from_secs(60),
        }
    }
}

/// Everything a release run needs to know, fixed for the run's duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub cli_repo_source: PathBuf,
    pub build_repo_source: PathBuf,
    pub cli_repo_branch: String,
    pub build_repo_branch: String,
    pub artifact_dir: PathBuf,
    pub source_bucket: String,
    pub release_bucket: String,
    pub source_container_registry: String,
    pub release_container_registry: String,
    pub cdn: String,
    pub bundle_number: u32,
    pub release_version: String,
    /// `YYYY-MM-DD`, used by weekly releases.
    pub release_date: String,
    pub release_time: DateTime<Utc>,
    pub dev_release: bool,
    pub dry_run: bool,
    pub weekly: bool,
    pub release_environment: ReleaseEnvironment,
    pub cli_min_version: String,
    pub cli_max_version: String,
    pub signing_key_id: String,
    /// Base64 of newline-separated paths excluded from the bundle signature.
    pub signing_excludes: String,
    pub not_found_retry: RetrySettings,
    pub transient_retry: RetrySettings,
}

impl ReleaseConfig {
    pub fn builder() -> ReleaseConfigBuilder {
        ReleaseConfigBuilder::default()
    }

    /// Version embedded in dev release image tags (`+` is not a valid tag character).
    pub fn dev_release_uri_version(&self) -> String {
        self.release_version.replace('+', "-")
    }

    /// Derive a config that carries the computed release version.
    pub fn with_release_version(&self, version: impl Into<String>) -> Self {
        Self {
            release_version: version.into(),
            ..self.clone()
        }
    }

    pub fn is_main_branch(&self) -> bool {
        self.build_repo_branch == MAIN_BRANCH
    }
}

/// Chained-setter builder for [`ReleaseConfig`].
#[derive(Debug, Clone)]
pub struct ReleaseConfigBuilder {
    config: ReleaseConfig,
}

impl Default for ReleaseConfigBuilder {
    fn default() -> Self {
        Self {
            config: ReleaseConfig {
                cli_repo_source: PathBuf::from("eks-anywhere"),
                build_repo_source: PathBuf::from("eks-anywhere-build-tooling"),
                cli_repo_branch: MAIN_BRANCH.to_string(),
                build_repo_branch: MAIN_BRANCH.to_string(),
                artifact_dir: PathBuf::from("downloaded-artifacts"),
                source_bucket: String::new(),
                release_bucket: String::new(),
                source_container_registry: String::new(),
                release_container_registry: String::new(),
                cdn: String::new(),
                bundle_number: 0,
                release_version: "vDev".to_string(),
                release_date: Utc::now().format("%Y-%m-%d").to_string(),
                release_time: Utc::now(),
                dev_release: true,
                dry_run: false,
                weekly: false,
                release_environment: ReleaseEnvironment::Development,
                cli_min_version: "v0.0.0".to_string(),
                cli_max_version: "v0.0.0".to_string(),
                signing_key_id: String::new(),
                signing_excludes: String::new(),
                not_found_retry: RetrySettings::not_found_default(),
                transient_retry: RetrySettings::transient_default(),
            },
        }
    }
}

impl ReleaseConfigBuilder {
    pub fn with_cli_repo(mut self, source: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        self.config.cli_repo_source = source.into();
        self.config.cli_repo_branch = branch.into();
        self
    }

    pub fn with_build_repo(
        mut self,
        source: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Self {
        self.config.build_repo_source = source.into();
        self.config.build_repo_branch = branch.into();
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = dir.into();
        self
    }

    pub fn with_buckets(mut self, source: impl Into<String>, release: impl Into<String>) -> Self {
        self.config.source_bucket = source.into();
        self.config.release_bucket = release.into();
        self
    }

    pub fn with_registries(
        mut self,
        source: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        self.config.source_container_registry = source.into();
        self.config.release_container_registry = release.into();
        self
    }

    pub fn with_cdn(mut self, cdn: impl Into<String>) -> Self {
        self.config.cdn = cdn.into();
        self
    }

    pub fn with_bundle_number(mut self, number: u32) -> Self {
        self.config.bundle_number = number;
        self
    }

    pub fn with_release_version(mut self, version: impl Into<String>) -> Self {
        self.config.release_version = version.into();
        self
    }

    pub fn with_release_date(mut self, date: impl Into<String>) -> Self {
        self.config.release_date = date.into();
        self
    }

    pub fn with_release_time(mut self, time: DateTime<Utc>) -> Self {
        self.config.release_time = time;
        self
    }

    pub fn with_dev_release(mut self, dev_release: bool) -> Self {
        self.config.dev_release = dev_release;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn with_weekly(mut self, weekly: bool) -> Self {
        self.config.weekly = weekly;
        self
    }

    pub fn with_release_environment(mut self, environment: ReleaseEnvironment) -> Self {
        self.config.release_environment = environment;
        self
    }

    pub fn with_cli_version_range(
        mut self,
        min: impl Into<String>,
        max: impl Into<String>,
    ) -> Self {
        self.config.cli_min_version = min.into();
        self.config.cli_max_version = max.into();
        self
    }

    pub fn with_signing(mut self, key_id: impl Into<String>, excludes: impl Into<String>) -> Self {
        self.config.signing_key_id = key_id.into();
        self.config.signing_excludes = excludes.into();
        self
    }

    pub fn with_retry(mut self, not_found: RetrySettings, transient: RetrySettings) -> Self {
        self.config.not_found_retry = not_found;
        self.config.transient_retry = transient;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ReleaseConfig> {
        let config = self.config;
        if config.source_bucket.is_empty() || config.release_bucket.is_empty() {
            return Err(ReleaseError::Config(
                "source and release buckets are required".to_string(),
            ));
        }
        if config.release_container_registry.is_empty() {
            return Err(ReleaseError::Config(
                "release container registry is required".to_string(),
            ));
        }
        if config.weekly && !config.dev_release {
            return Err(ReleaseError::Config(
                "weekly releases must be dev releases".to_string(),
            ));
        }
        if !config.dev_release && config.release_environment != ReleaseEnvironment::Production {
            return Err(ReleaseError::Config(
                "production bundles require the production release environment".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ReleaseConfigBuilder {
        ReleaseConfig::builder()
            .with_buckets("source", "release")
            .with_registries("src.example", "public.example")
    }

    #[test]
    fn retry_defaults() {
        let nf = RetrySettings::not_found_default();
        assert_eq!(nf.max_retries, 60);
        assert_eq!(nf.wait, Duration::from_secs(30));
        assert_eq!(RetrySettings::transient_default().max_retries, 10);
    }

    #[test]
    fn uri_version_replaces_plus() {
        let config = base()
            .with_release_version("v0.18.10-dev+build.100")
            .build()
            .unwrap();
        assert_eq!(config.dev_release_uri_version(), "v0.18.10-dev-build.100");
    }

    #[test]
    fn derived_config_keeps_other_fields() {
        let config = base().with_bundle_number(7).build().unwrap();
        let derived = config.with_release_version("v0.0.0-dev+build.3");
        assert_eq!(derived.bundle_number, 7);
        assert_eq!(derived.release_version, "v0.0.0-dev+build.3");
        assert_eq!(config.release_version, "vDev");
    }

    #[test]
    fn missing_buckets_rejected() {
        let err = ReleaseConfig::builder().build().unwrap_err();
        assert!(matches!(err, ReleaseError::Config(_)));
    }

    #[test]
    fn weekly_production_rejected() {
        let err = base()
            .with_dev_release(false)
            .with_weekly(true)
            .with_release_environment(ReleaseEnvironment::Production)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("weekly"));
    }

    #[test]
    fn environment_parses() {
        assert_eq!(
            "production".parse::<ReleaseEnvironment>().unwrap(),
            ReleaseEnvironment::Production
        );
        assert!("staging".parse::<ReleaseEnvironment>().is_err());
    }
}
