//! Artifact store backends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use conveyor_core::artifact::{
    ArtifactKey, ArtifactRef, ArtifactStore, PruneStats, RetentionPolicy,
};
use conveyor_core::{Error, Result, RunId};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

const ARTIFACT_EXTENSION: &str = "artifact";
const STAGING_EXTENSION: &str = "partial";

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// In-process store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryArtifactStore {
    runs: RwLock<BTreeMap<RunId, BTreeMap<String, (ArtifactRef, Bytes)>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef> {
        let mut runs = self.runs.write().await;
        let artifacts = runs.entry(key.run_id).or_default();
        if artifacts.contains_key(&key.name) {
            return Err(Error::ArtifactExists(key.to_string()));
        }

        let reference = ArtifactRef {
            key: key.clone(),
            location: format!("memory://{}", key),
            checksum: checksum(&data),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        artifacts.insert(key.name.clone(), (reference.clone(), data));
        debug!(artifact = %key, size = reference.size, "Stored artifact");
        Ok(reference)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Bytes> {
        let runs = self.runs.read().await;
        runs.get(&key.run_id)
            .and_then(|artifacts| artifacts.get(&key.name))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Error::ArtifactNotFound(key.to_string()))
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(run_id)
            .map(|artifacts| artifacts.values().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, policy: RetentionPolicy) -> Result<PruneStats> {
        let mut runs = self.runs.write().await;
        let mut stats = PruneStats::default();

        // Run ids sort by creation time, so the oldest come first.
        let excess = runs.len().saturating_sub(policy.keep_runs);
        let doomed: Vec<RunId> = runs.keys().take(excess).copied().collect();
        for run_id in doomed {
            if let Some(artifacts) = runs.remove(&run_id) {
                stats.runs_deleted += 1;
                stats.artifacts_deleted += artifacts.len() as u64;
                stats.bytes_freed += artifacts.values().map(|(r, _)| r.size).sum::<u64>();
            }
        }

        Ok(stats)
    }
}

/// Stores artifacts as files under `root/<run id>/<name>.artifact`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf> {
        let name = &key.name;
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(Error::Internal(format!(
                "artifact name '{}' is not a valid file name",
                name
            )));
        }
        Ok(self
            .run_dir(&key.run_id)
            .join(format!("{}.{}", name, ARTIFACT_EXTENSION)))
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<RunId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn reference(&self, run_id: &RunId, path: &Path) -> Result<Option<ArtifactRef>> {
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION)))
        else {
            return Ok(None);
        };

        let data = tokio::fs::read(path).await?;
        let metadata = tokio::fs::metadata(path).await?;
        let created_at = metadata
            .modified()
            .map(chrono::DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(ArtifactRef {
            key: ArtifactKey::new(*run_id, name),
            location: path.to_string_lossy().to_string(),
            checksum: checksum(&data),
            size: data.len() as u64,
            created_at,
        }))
    }
}

/// Write `data` to `staging`, sync it, then link it to `target`. The link
/// fails with `AlreadyExists` when another put won.
async fn publish(staging: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::hard_link(staging, target).await
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    /// Writes land in a hidden temp file and are published by hard-linking
    /// it under the artifact's name, so readers never see a partial file.
    async fn put(&self, key: &ArtifactKey, data: Bytes) -> Result<ArtifactRef> {
        let path = self.path_for(key)?;
        let run_dir = self.run_dir(&key.run_id);
        tokio::fs::create_dir_all(&run_dir).await?;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::ArtifactExists(key.to_string()));
        }

        let staging = run_dir.join(format!(
            ".{}.{}.{}",
            key.name,
            uuid::Uuid::new_v4().simple(),
            STAGING_EXTENSION
        ));
        let published = publish(&staging, &path, &data).await;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %staging.display(), error = %e, "Failed to remove staging file");
            }
        }
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::ArtifactExists(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(artifact = %key, path = %path.display(), size = data.len(), "Stored artifact");
        Ok(ArtifactRef {
            key: key.clone(),
            location: path.to_string_lossy().to_string(),
            checksum: checksum(&data),
            size: data.len() as u64,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::ArtifactNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>> {
        let mut entries = match tokio::fs::read_dir(self.run_dir(run_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut refs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(reference) = self.reference(run_id, &entry.path()).await? {
                refs.push(reference);
            }
        }
        refs.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        Ok(refs)
    }

    async fn prune(&self, policy: RetentionPolicy) -> Result<PruneStats> {
        let ids = self.run_ids().await?;
        let excess = ids.len().saturating_sub(policy.keep_runs);
        let mut stats = PruneStats::default();

        for run_id in ids.into_iter().take(excess) {
            let artifacts = self.list(&run_id).await?;
            stats.artifacts_deleted += artifacts.len() as u64;
            stats.bytes_freed += artifacts.iter().map(|a| a.size).sum::<u64>();
            tokio::fs::remove_dir_all(self.run_dir(&run_id)).await?;
            stats.runs_deleted += 1;
        }

        if stats.runs_deleted > 0 {
            info!(
                runs = stats.runs_deleted,
                artifacts = stats.artifacts_deleted,
                bytes = stats.bytes_freed,
                "Pruned artifacts"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_once(store: &dyn ArtifactStore) {
        let key = ArtifactKey::new(RunId::new(), "BuildOutput");

        let stored = store.put(&key, Bytes::from_static(b"image")).await.unwrap();
        assert_eq!(stored.size, 5);
        assert_eq!(stored.checksum, checksum(b"image"));

        let second = store.put(&key, Bytes::from_static(b"other")).await;
        assert!(matches!(second, Err(Error::ArtifactExists(_))));
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"image"));
    }

    async fn prune_keeps_newest(store: &dyn ArtifactStore) {
        let mut runs = Vec::new();
        for _ in 0..3 {
            runs.push(RunId::new());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        for run_id in &runs {
            store
                .put(&ArtifactKey::new(*run_id, "SourceOutput"), Bytes::from_static(b"src"))
                .await
                .unwrap();
        }

        let stats = store.prune(RetentionPolicy { keep_runs: 2 }).await.unwrap();
        assert_eq!(stats.runs_deleted, 1);
        assert_eq!(stats.artifacts_deleted, 1);
        assert_eq!(stats.bytes_freed, 3);

        assert!(store.list(&runs[0]).await.unwrap().is_empty());
        assert_eq!(store.list(&runs[2]).await.unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_memory_store_is_write_once() {
        write_once(&MemoryArtifactStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_prune() {
        prune_keeps_newest(&MemoryArtifactStore::new()).await;
    }

    #[tokio::test]
    async fn test_fs_store_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        write_once(&FsArtifactStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_fs_store_prune() {
        let dir = tempfile::tempdir().unwrap();
        prune_keeps_newest(&FsArtifactStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new(RunId::new(), "Nope");

        assert!(matches!(
            store.get(&key).await,
            Err(Error::ArtifactNotFound(_))
        ));
        assert!(store.list(&key.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_lists_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run_id = RunId::new();
        for name in ["b", "a"] {
            store
                .put(&ArtifactKey::new(run_id, name), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let names: Vec<String> = store
            .list(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fs_store_interrupted_put_leaves_key_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsArtifactStore::new(dir.path()));
        let key = ArtifactKey::new(RunId::new(), "image");
        let data = Bytes::from(vec![7u8; 64 * 1024 * 1024]);

        let writer = {
            let store = store.clone();
            let key = key.clone();
            let data = data.clone();
            tokio::spawn(async move { store.put(&key, data).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        writer.abort();
        let _ = writer.await;

        // Whatever the timing, the key holds either nothing or everything.
        match store.get(&key).await {
            Ok(stored) => assert_eq!(stored.len(), data.len()),
            Err(Error::ArtifactNotFound(_)) => {
                let retried = store.put(&key, data.clone()).await.unwrap();
                assert_eq!(retried.size, data.len() as u64);
                assert_eq!(store.get(&key).await.unwrap(), data);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_fs_store_ignores_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new(RunId::new(), "image");
        let run_dir = dir.path().join(key.run_id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join(".image.abc.partial"), b"half").unwrap();

        assert!(store.list(&key.run_id).await.unwrap().is_empty());
        assert!(matches!(store.get(&key).await, Err(Error::ArtifactNotFound(_))));

        store.put(&key, Bytes::from_static(b"whole")).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"whole"));
        let names: Vec<_> = std::fs::read_dir(&run_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"image.artifact".to_string()));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let key = ArtifactKey::new(RunId::new(), "../escape");

        assert!(store.put(&key, Bytes::new()).await.is_err());
    }
}
