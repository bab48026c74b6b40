//! Helm CLI implementation of [`ChartTool`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{ClientError, ClientResult};
use crate::registry::ImageReference;
use crate::traits::{ChartTool, RegistryCredentials};

const PACKAGED_MARKER: &str = "saved it to:";

/// Drives the `helm` binary. Logs into the source registry before pulls and
/// the destination registry before pushes when credentials are configured.
#[derive(Debug, Default, Clone)]
pub struct HelmCli {
    source: Option<RegistryCredentials>,
    destination: Option<RegistryCredentials>,
}

impl HelmCli {
    pub fn new(
        source: Option<RegistryCredentials>,
        destination: Option<RegistryCredentials>,
    ) -> Self {
        Self {
            source,
            destination,
        }
    }

    async fn login(&self, registry: &str, creds: Option<&RegistryCredentials>) -> ClientResult<()> {
        let Some(creds) = creds else {
            return Ok(());
        };
        run_helm(&[
            "registry",
            "login",
            registry,
            "--username",
            &creds.username,
            "--password",
            &creds.password,
        ])
        .await
        .map(|_| ())
    }
}

fn oci(uri: &str) -> String {
    if uri.starts_with("oci://") {
        uri.to_string()
    } else {
        format!("oci://{uri}")
    }
}

async fn run_helm(args: &[&str]) -> ClientResult<String> {
    let command = format!("helm {}", args.first().copied().unwrap_or_default());
    let output = Command::new("helm")
        .args(args)
        .output()
        .await
        .map_err(|e| ClientError::CommandFailed {
            command: command.clone(),
            detail: format!("failed to run helm: {e}"),
        })?;
    if !output.status.success() {
        return Err(ClientError::CommandFailed {
            command,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Extract the archive path from `helm package` output.
pub fn parse_packaged_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .find_map(|line| line.split_once(PACKAGED_MARKER))
        .map(|(_, path)| PathBuf::from(path.trim()))
}

#[async_trait]
impl ChartTool for HelmCli {
    async fn pull(&self, chart_ref: &str, version: &str, work_dir: &Path) -> ClientResult<PathBuf> {
        let image = ImageReference::parse(chart_ref)?;
        self.login(&image.registry, self.source.as_ref()).await?;

        let untar_dir = work_dir.to_string_lossy().to_string();
        info!(chart = %chart_ref, version = %version, "pulling helm chart");
        run_helm(&[
            "pull",
            &oci(&image.name()),
            "--version",
            version,
            "--untar",
            "--untardir",
            &untar_dir,
        ])
        .await?;

        let chart_name = image
            .repository
            .rsplit('/')
            .next()
            .unwrap_or(&image.repository);
        Ok(work_dir.join(chart_name))
    }

    async fn package(&self, chart_dir: &Path, out_dir: &Path) -> ClientResult<PathBuf> {
        let chart = chart_dir.to_string_lossy().to_string();
        let out = out_dir.to_string_lossy().to_string();
        let stdout = run_helm(&["package", &chart, "--destination", &out]).await?;
        parse_packaged_path(&stdout).ok_or_else(|| ClientError::CommandFailed {
            command: "helm package".to_string(),
            detail: format!("unexpected output: {stdout}"),
        })
    }

    async fn push(&self, package: &Path, remote: &str) -> ClientResult<()> {
        let registry = remote
            .trim_start_matches("oci://")
            .split('/')
            .next()
            .unwrap_or(remote);
        self.login(registry, self.destination.as_ref()).await?;

        let package = package.to_string_lossy().to_string();
        info!(package = %package, remote = %remote, "pushing helm chart");
        run_helm(&["push", &package, &oci(remote)]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_path_is_parsed() {
        let out = "Successfully packaged chart and saved it to: /tmp/work/eks-anywhere-packages-0.4.2.tgz\n";
        assert_eq!(
            parse_packaged_path(out),
            Some(PathBuf::from("/tmp/work/eks-anywhere-packages-0.4.2.tgz"))
        );
    }

    #[test]
    fn packaged_path_missing_marker() {
        assert_eq!(parse_packaged_path("Error: chart not found"), None);
    }

    #[test]
    fn oci_prefix_is_idempotent() {
        assert_eq!(oci("r.example/a"), "oci://r.example/a");
        assert_eq!(oci("oci://r.example/a"), "oci://r.example/a");
    }
}
