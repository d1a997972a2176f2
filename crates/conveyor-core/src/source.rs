//! Version-control source abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// What a fetch checked out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    /// Commit identifier, when the provider knows it.
    pub commit: Option<String>,
}

/// Trait for source providers.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check out `branch` of `repository` into the empty directory `dest`.
    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<SourceRevision>;
}
