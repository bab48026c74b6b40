//! Git CLI implementation of [`SourceControl`].

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ClientError, ClientResult};
use crate::traits::SourceControl;

/// Runs the `git` binary against local working copies.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }
}

async fn run_git(repo: &Path, args: &[&str]) -> ClientResult<String> {
    let command = format!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| ClientError::CommandFailed {
            command: command.clone(),
            detail: format!("failed to run git: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ClientError::CommandFailed {
            command,
            detail: stderr.trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() && !matches!(args.first(), Some(&"checkout")) {
        return Err(ClientError::CommandFailed {
            command,
            detail: "empty output".to_string(),
        });
    }
    Ok(stdout)
}

#[async_trait]
impl SourceControl for GitCli {
    async fn checkout(&self, repo: &Path, branch: &str) -> ClientResult<()> {
        run_git(repo, &["checkout", branch]).await.map(|_| ())
    }

    async fn describe_tag(&self, repo: &Path) -> ClientResult<String> {
        run_git(repo, &["describe", "--tag"]).await
    }

    async fn head(&self, repo: &Path) -> ClientResult<String> {
        run_git(repo, &["rev-parse", "HEAD"]).await
    }

    async fn current_branch(&self, repo: &Path) -> ClientResult<String> {
        run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }
}
