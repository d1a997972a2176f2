//! Per-action scratch directories and conversion between directories and
//! artifact bundles.

use conveyor_core::artifact::Bundle;
use conveyor_core::{Error, Result, RunId};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory names never captured into a bundle.
const IGNORED_DIRS: &[&str] = &[".git"];

/// A scratch directory owned by one action attempt.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create `root/<run>/<action>-<suffix>`.
    pub async fn create(root: &Path, run_id: &RunId, action: &str) -> Result<Self> {
        let dir_name = format!("{}-{}", sanitize(action), uuid::Uuid::new_v4().simple());
        let path = root.join(run_id.to_string()).join(dir_name);
        tokio::fs::create_dir_all(&path).await?;
        debug!(path = %path.display(), "Created workspace");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every file of `bundle` below the workspace.
    pub async fn materialize(&self, bundle: &Bundle) -> Result<()> {
        for (relative, contents) in &bundle.files {
            let target = self.path.join(safe_relative(relative)?);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
        }
        Ok(())
    }

    /// Collect the files matching `patterns` (relative globs). Each pattern
    /// must match at least one file.
    pub async fn collect(&self, patterns: Vec<String>) -> Result<Bundle> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || collect_blocking(&root, &patterns))
            .await
            .map_err(|e| Error::Internal(format!("collect task failed: {}", e)))?
    }

    /// Capture the whole workspace, minus version-control metadata.
    pub async fn snapshot(&self) -> Result<Bundle> {
        self.collect(vec!["**/*".to_string()]).await
    }

    /// Delete the workspace directory.
    pub async fn remove(self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.path).await?;
        Ok(())
    }
}

fn collect_blocking(root: &Path, patterns: &[String]) -> Result<Bundle> {
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    let mut bundle = Bundle::new();

    for pattern in patterns {
        safe_relative(pattern)?;
        let full = format!("{}/{}", escaped_root, pattern);
        let paths = glob::glob(&full).map_err(|e| Error::Internal(format!(
            "invalid artifact pattern '{}': {}",
            pattern, e
        )))?;

        let mut matched = 0usize;
        for entry in paths {
            let path = entry.map_err(|e| Error::Io(e.into()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if relative
                .components()
                .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
            {
                continue;
            }
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            bundle.insert(key, std::fs::read(&path)?);
            matched += 1;
        }

        if matched == 0 && pattern != "**/*" {
            return Err(Error::ArtifactNotFound(format!(
                "pattern '{}' matched no files",
                pattern
            )));
        }
    }

    Ok(bundle)
}

/// Reject absolute paths and parent traversal.
fn safe_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if p.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(p)
    } else {
        Err(Error::Internal(format!(
            "path '{}' escapes the workspace",
            path
        )))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
