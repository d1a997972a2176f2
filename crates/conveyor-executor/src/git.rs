//! Git source provider.

use async_trait::async_trait;
use conveyor_core::source::{SourceProvider, SourceRevision};
use conveyor_core::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Fetches a branch with a shallow `git clone`.
pub struct GitSource {
    depth: Option<u32>,
}

impl GitSource {
    pub fn new() -> Self {
        Self { depth: Some(1) }
    }

    /// Clone full history instead of a shallow copy.
    pub fn full_history() -> Self {
        Self { depth: None }
    }

    fn clone_args(&self, repository: &str, branch: &str, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "clone".to_string(),
            "--single-branch".to_string(),
            "--branch".to_string(),
            branch.to_string(),
        ];
        if let Some(depth) = self.depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        args.push(repository.to_string());
        args.push(dest.to_string_lossy().to_string());
        args
    }
}

impl Default for GitSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<SourceRevision> {
        info!(repository = %repository, branch = %branch, "Cloning repository");

        let output = Command::new("git")
            .args(self.clone_args(repository, branch, dest))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            warn!(repository = %repository, "Git clone failed");
            return Err(Error::ActionExecution {
                action: "git clone".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            });
        }

        let commit = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dest)
            .output()
            .await
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

        info!(repository = %repository, commit = ?commit, "Repository cloned");
        Ok(SourceRevision { commit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_clone_args() {
        let args = GitSource::new().clone_args("https://example.com/apt.git", "main", Path::new("/tmp/src"));
        assert_eq!(
            args,
            vec![
                "clone",
                "--single-branch",
                "--branch",
                "main",
                "--depth",
                "1",
                "https://example.com/apt.git",
                "/tmp/src",
            ]
        );
    }

    #[test]
    fn test_full_history_args() {
        let args = GitSource::full_history().clone_args("repo", "dev", Path::new("out"));
        assert!(!args.contains(&"--depth".to_string()));
    }

    #[tokio::test]
    async fn test_missing_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = GitSource::new()
            .fetch(
                &dir.path().join("does-not-exist").to_string_lossy(),
                "main",
                &dir.path().join("checkout"),
            )
            .await;
        assert!(result.is_err());
    }
}
