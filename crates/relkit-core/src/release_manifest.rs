//! The Release manifest: every published CLI release and its bundle.

use serde::{Deserialize, Serialize};

use crate::bundle::{ObjectMeta, API_VERSION};
use crate::error::Result;

pub const RELEASE_KIND: &str = "Release";
pub const RELEASE_NAME: &str = "eks-anywhere";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ReleaseSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

/// One published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub date: String,
    pub version: String,
    pub number: u32,
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub git_tag: String,
    pub bundle_manifest_url: String,
}

impl Release {
    /// Version up to the first `+`.
    pub fn version_prefix(&self) -> &str {
        self.version
            .split_once('+')
            .map_or(self.version.as_str(), |(prefix, _)| prefix)
    }
}

impl Default for ReleaseManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: RELEASE_KIND.to_string(),
            metadata: ObjectMeta {
                name: RELEASE_NAME.to_string(),
                ..Default::default()
            },
            spec: ReleaseSpec::default(),
        }
    }
}

impl ReleaseManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Replace the release sharing `release`'s version prefix, or append it.
    pub fn append_or_update_release(&mut self, release: Release) {
        let prefix = release.version_prefix().to_string();
        match self
            .spec
            .releases
            .iter_mut()
            .find(|existing| existing.version_prefix() == prefix)
        {
            Some(existing) => *existing = release,
            None => self.spec.releases.push(release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(version: &str, number: u32) -> Release {
        Release {
            date: "2024-03-01".to_string(),
            version: version.to_string(),
            number,
            git_commit: "0123abc".to_string(),
            git_tag: version.split('+').next().unwrap().to_string(),
            bundle_manifest_url: format!("https://cdn.example/bundles/{number}/manifest.yaml"),
        }
    }

    #[test]
    fn same_prefix_updates_in_place() {
        let mut manifest = ReleaseManifest::default();
        manifest.append_or_update_release(release("v0.0.0-dev+build.1", 1));
        manifest.append_or_update_release(release("v0.1.0", 2));
        manifest.append_or_update_release(release("v0.0.0-dev+build.2", 3));

        assert_eq!(manifest.spec.releases.len(), 2);
        assert_eq!(manifest.spec.releases[0].version, "v0.0.0-dev+build.2");
        assert_eq!(manifest.spec.releases[0].number, 3);
        assert_eq!(manifest.spec.releases[1].version, "v0.1.0");
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let mut once = ReleaseManifest::default();
        once.append_or_update_release(release("v0.2.0", 4));
        let mut twice = once.clone();
        twice.append_or_update_release(release("v0.2.0", 4));
        assert_eq!(once, twice);
    }

    #[test]
    fn yaml_uses_release_kind() {
        let yaml = ReleaseManifest::default().to_yaml().unwrap();
        assert!(yaml.contains("kind: Release"));
        assert!(yaml.contains("name: eks-anywhere"));
        let parsed = ReleaseManifest::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.metadata.name, RELEASE_NAME);
    }
}
