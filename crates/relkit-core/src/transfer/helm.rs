//! Helm chart republishing.
//!
//! A chart is pulled at its source tag, its `Chart.yaml` version is set to the
//! release tag, and it is packaged and pushed to the release repository. The
//! package controller chart also gets its image tags pinned in `values.yaml`.

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::info;

use super::TransferContext;
use crate::artifact::{Artifact, ArtifactsTable, ImageArtifact};
use crate::error::{ReleaseError, Result};

/// Asset name of the package controller chart and its project.
pub const PACKAGES_ASSET: &str = "eks-anywhere-packages";
pub const TOKEN_REFRESHER_ASSET: &str = "ecr-token-refresher";

/// Pull, rewrite, package and push one chart artifact.
pub async fn publish_chart(ctx: &TransferContext, image: &ImageArtifact) -> Result<()> {
    let (chart_ref, version) = image
        .source_image_uri
        .rsplit_once(':')
        .ok_or_else(|| ReleaseError::Chart(format!("chart {} has no tag", image.source_image_uri)))?;

    let work_dir = tempfile::tempdir()?;
    let chart_dir = ctx.charts.pull(chart_ref, version, work_dir.path()).await?;

    let release_tag = image.release_tag();
    set_chart_version(&chart_dir.join("Chart.yaml"), release_tag).await?;
    info!(chart = %chart_ref, version = %release_tag, "chart version rewritten");

    if image.asset_name == PACKAGES_ASSET {
        let tags = packages_image_tags(&ctx.table)?;
        set_values_image_tags(&chart_dir.join("values.yaml"), &tags, None).await?;
    }

    let package = ctx.charts.package(&chart_dir, work_dir.path()).await?;
    let remote = image
        .release_repository()
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or(image.release_repository());
    ctx.charts.push(&package, remote).await?;
    Ok(())
}

async fn read_yaml(path: &Path) -> Result<Value> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ReleaseError::Chart(format!("reading {}: {e}", path.display())))?;
    Ok(serde_yaml::from_str(&contents)?)
}

async fn write_yaml(path: &Path, value: &Value) -> Result<()> {
    tokio::fs::write(path, serde_yaml::to_string(value)?).await?;
    Ok(())
}

/// Overwrite the `version` field of a `Chart.yaml`.
pub async fn set_chart_version(chart_yaml: &Path, version: &str) -> Result<()> {
    let mut chart = read_yaml(chart_yaml).await?;
    let map = chart
        .as_mapping_mut()
        .ok_or_else(|| ReleaseError::Chart(format!("{} is not a mapping", chart_yaml.display())))?;
    map.insert(Value::from("version"), Value::from(version));
    write_yaml(chart_yaml, &chart).await
}

/// Release tags of the package controller images, keyed by asset name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageImageTags {
    pub controller: String,
    pub token_refresher: String,
}

/// Release tags of the controller and token refresher images.
pub fn packages_image_tags(table: &ArtifactsTable) -> Result<PackageImageTags> {
    let tags: BTreeMap<String, String> = table
        .load(PACKAGES_ASSET)?
        .iter()
        .filter_map(Artifact::as_image)
        .map(|image| (image.asset_name.clone(), image.release_tag().to_string()))
        .collect();

    let lookup = |asset: &str| {
        tags.get(asset).cloned().ok_or_else(|| {
            ReleaseError::Chart(format!("no {asset} image found for {PACKAGES_ASSET}"))
        })
    };
    Ok(PackageImageTags {
        controller: lookup(PACKAGES_ASSET)?,
        token_refresher: lookup(TOKEN_REFRESHER_ASSET)?,
    })
}

/// Pin `controller.tag` and `cronjob.tag` (and optionally their digests).
pub async fn set_values_image_tags(
    values_yaml: &Path,
    tags: &PackageImageTags,
    digests: Option<&PackageImageTags>,
) -> Result<()> {
    let mut values = read_yaml(values_yaml).await?;
    set_nested(&mut values, "controller", "tag", &tags.controller)?;
    set_nested(&mut values, "cronjob", "tag", &tags.token_refresher)?;
    if let Some(digests) = digests {
        set_nested(&mut values, "controller", "digest", &digests.controller)?;
        set_nested(&mut values, "cronjob", "digest", &digests.token_refresher)?;
    }
    write_yaml(values_yaml, &values).await
}

fn set_nested(root: &mut Value, section: &str, field: &str, value: &str) -> Result<()> {
    let section_map: &mut Mapping = root
        .get_mut(section)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| ReleaseError::Chart(format!("values.yaml has no {section} section")))?;
    section_map.insert(Value::from(field), Value::from(value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::image;

    const VALUES: &str = "controller:\n  tag: old\n  repository: pkg\ncronjob:\n  tag: old\n";

    fn packages_table() -> ArtifactsTable {
        let table = ArtifactsTable::new();
        table.store(
            PACKAGES_ASSET,
            vec![
                image(PACKAGES_ASSET, "public.example/eks-anywhere-packages:v0.3.0-eks-a-5"),
                image(TOKEN_REFRESHER_ASSET, "public.example/ecr-token-refresher:v0.1.0-eks-a-5"),
            ],
        );
        table
    }

    #[tokio::test]
    async fn chart_version_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let chart = dir.path().join("Chart.yaml");
        std::fs::write(&chart, "apiVersion: v2\nname: cilium\nversion: 1.0.0\n").unwrap();

        set_chart_version(&chart, "1.13.2-eks-a-9").await.unwrap();
        let value: Value = serde_yaml::from_str(&std::fs::read_to_string(&chart).unwrap()).unwrap();
        assert_eq!(value["version"], Value::from("1.13.2-eks-a-9"));
        assert_eq!(value["name"], Value::from("cilium"));
    }

    #[test]
    fn packages_tags_come_from_release_uris() {
        let tags = packages_image_tags(&packages_table()).unwrap();
        assert_eq!(tags.controller, "v0.3.0-eks-a-5");
        assert_eq!(tags.token_refresher, "v0.1.0-eks-a-5");
    }

    #[test]
    fn missing_refresher_is_an_error() {
        let table = ArtifactsTable::new();
        table.store(
            PACKAGES_ASSET,
            vec![image(PACKAGES_ASSET, "public.example/eks-anywhere-packages:v1")],
        );
        let err = packages_image_tags(&table).unwrap_err();
        assert!(err.to_string().contains(TOKEN_REFRESHER_ASSET));
    }

    #[tokio::test]
    async fn values_tags_and_digests_are_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let values = dir.path().join("values.yaml");
        std::fs::write(&values, VALUES).unwrap();
        let tags = packages_image_tags(&packages_table()).unwrap();
        let digests = PackageImageTags {
            controller: "sha256:aaa".to_string(),
            token_refresher: "sha256:bbb".to_string(),
        };

        set_values_image_tags(&values, &tags, Some(&digests)).await.unwrap();
        let value: Value = serde_yaml::from_str(&std::fs::read_to_string(&values).unwrap()).unwrap();
        assert_eq!(value["controller"]["tag"], Value::from("v0.3.0-eks-a-5"));
        assert_eq!(value["controller"]["repository"], Value::from("pkg"));
        assert_eq!(value["cronjob"]["digest"], Value::from("sha256:bbb"));
    }
}
