//! Artifact storage abstraction.
//!
//! Artifacts are write-once: a producing action stores its bundle under
//! `(run_id, name)` exactly once, and consuming actions only read it.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result, RunId};

/// Key for storing/retrieving an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Pipeline run ID.
    pub run_id: RunId,
    /// Artifact name, unique per run.
    pub name: String,
}

impl ArtifactKey {
    pub fn new(run_id: RunId, name: impl Into<String>) -> Self {
        Self {
            run_id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.name)
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    /// SHA-256 of the stored bytes, hex encoded.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

/// Leading bytes of an encoded bundle.
const BUNDLE_MAGIC: &[u8; 4] = b"CVB1";

/// The files an artifact logically contains, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Encode for storage: the magic, a file count, then each path and
    /// its contents with big-endian `u64` length prefixes.
    pub fn to_bytes(&self) -> Bytes {
        let payload: usize = self
            .files
            .iter()
            .map(|(path, contents)| 16 + path.len() + contents.len())
            .sum();
        let mut buf = BytesMut::with_capacity(BUNDLE_MAGIC.len() + 8 + payload);
        buf.put_slice(BUNDLE_MAGIC);
        buf.put_u64(self.files.len() as u64);
        for (path, contents) in &self.files {
            buf.put_u64(path.len() as u64);
            buf.put_slice(path.as_bytes());
            buf.put_u64(contents.len() as u64);
            buf.put_slice(contents);
        }
        buf.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if !data.starts_with(BUNDLE_MAGIC) {
            return Err(Error::Internal("not an encoded bundle".to_string()));
        }
        data.advance(BUNDLE_MAGIC.len());

        let count = take_u64(&mut data)?;
        let mut bundle = Bundle::new();
        for _ in 0..count {
            let path = take_chunk(&mut data)?;
            let path = String::from_utf8(path)
                .map_err(|e| Error::Internal(format!("bundle path is not UTF-8: {}", e)))?;
            let contents = take_chunk(&mut data)?;
            bundle.files.insert(path, contents);
        }
        if data.has_remaining() {
            return Err(Error::Internal(format!(
                "{} trailing bytes after bundle",
                data.remaining()
            )));
        }
        Ok(bundle)
    }
}

fn truncated() -> Error {
    Error::Internal("bundle is truncated".to_string())
}

fn take_u64(data: &mut &[u8]) -> Result<u64> {
    if data.remaining() < 8 {
        return Err(truncated());
    }
    Ok(data.get_u64())
}

fn take_chunk(data: &mut &[u8]) -> Result<Vec<u8>> {
    let len = usize::try_from(take_u64(data)?).map_err(|_| truncated())?;
    if data.remaining() < len {
        return Err(truncated());
    }
    let chunk = data[..len].to_vec();
    data.advance(len);
    Ok(chunk)
}

/// Policy for artifact retention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Number of most recent runs whose artifacts are kept.
    pub keep_runs: usize,
}

/// Statistics from a prune operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneStats {
    pub runs_deleted: u64,
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Fails with [`Error::ArtifactExists`] if the key is taken.
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact.
    async fn get(&self, key: &ArtifactKey) -> Result<Bytes>;

    /// List artifacts for a pipeline run.
    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>>;

    /// Drop the artifacts of all but the newest runs.
    async fn prune(&self, policy: RetentionPolicy) -> Result<PruneStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_encoding_is_compact() {
        let image = vec![0xffu8; 1_000_000];
        let bundle = Bundle::new()
            .with_file("app.tar", image.clone())
            .with_file("imagedefinitions.json", "[]");

        let encoded = bundle.to_bytes();

        let overhead = encoded.len() - image.len() - 2 - "app.tar".len() - "imagedefinitions.json".len();
        assert_eq!(overhead, 4 + 8 + 2 * 16);
        assert_eq!(Bundle::from_bytes(&encoded).unwrap(), bundle);
    }

    #[test]
    fn test_empty_bundle() {
        let encoded = Bundle::new().to_bytes();
        assert_eq!(encoded.len(), 12);
        assert!(Bundle::from_bytes(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_damaged_bundles_are_rejected() {
        let encoded = Bundle::new().with_file("a", "hello").to_bytes();

        assert!(Bundle::from_bytes(&encoded[..encoded.len() - 1]).is_err());
        assert!(Bundle::from_bytes(b"{\"files\":{}}").is_err());

        let mut extended = encoded.to_vec();
        extended.push(0);
        assert!(Bundle::from_bytes(&extended).is_err());
    }
}
