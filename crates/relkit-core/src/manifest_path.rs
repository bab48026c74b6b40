//! Object keys of the published bundles and release manifests.

use crate::config::{ReleaseConfig, MAIN_BRANCH};

/// Which manifest a key is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Bundles,
    Release,
}

/// Inputs that fully determine a manifest key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPathParams<'a> {
    pub dev_release: bool,
    pub weekly: bool,
    pub bundle_number: u32,
    pub branch: &'a str,
    pub release_date: &'a str,
    /// Dev release version with `+` replaced by `-`.
    pub uri_version: &'a str,
}

impl<'a> ManifestPathParams<'a> {
    pub fn from_config(config: &'a ReleaseConfig, uri_version: &'a str) -> Self {
        Self {
            dev_release: config.dev_release,
            weekly: config.weekly,
            bundle_number: config.bundle_number,
            branch: &config.build_repo_branch,
            release_date: &config.release_date,
            uri_version,
        }
    }
}

pub fn manifest_filepath(params: &ManifestPathParams<'_>, kind: ManifestKind) -> String {
    match (kind, params.dev_release) {
        (ManifestKind::Bundles, true) => {
            if params.weekly {
                format!("weekly-releases/{}/bundle-release.yaml", params.release_date)
            } else if params.branch != MAIN_BRANCH {
                format!("{}/{}/bundles.yaml", params.branch, params.uri_version)
            } else {
                "bundle-release.yaml".to_string()
            }
        }
        (ManifestKind::Bundles, false) => {
            format!("releases/bundles/{}/manifest.yaml", params.bundle_number)
        }
        (ManifestKind::Release, true) => {
            if params.weekly {
                format!("weekly-releases/{}/eks-a-release.yaml", params.release_date)
            } else if params.branch != MAIN_BRANCH {
                format!("{}/eks-a-release.yaml", params.branch)
            } else {
                "eks-a-release.yaml".to_string()
            }
        }
        (ManifestKind::Release, false) => "releases/eks-a/manifest.yaml".to_string(),
    }
}

/// Key of the file recording the latest dev release version of `branch`.
pub fn latest_release_version_key(branch: &str) -> String {
    if branch == MAIN_BRANCH {
        "LATEST_RELEASE_VERSION".to_string()
    } else {
        format!("{branch}/LATEST_RELEASE_VERSION")
    }
}
