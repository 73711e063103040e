use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::{BlobStore, ContentDigest, StorageResult};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    objects_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a new `FsBlobStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn put_blocking(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        let shard_dir = self.objects_dir.join(&digest.as_str()[..2]);
        fs::create_dir_all(&shard_dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(digest)
    }

    fn get_blocking(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    digest: digest.as_str().to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    fn delete_blocking(&self, digest: &ContentDigest) -> StorageResult<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("blob task failed: {e}")))?
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let store = self.clone();
        let data = data.to_vec();
        blocking(move || store.put_blocking(&data)).await
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.clone();
        let digest = digest.clone();
        blocking(move || store.get_blocking(&digest)).await
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.blob_path(digest).exists())
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let store = self.clone();
        let digest = digest.clone();
        blocking(move || store.delete_blocking(&digest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let (_dir, store) = make_store();
        let data = b"hello world";
        let digest = store.put(data).await.unwrap();
        let got = store.get(&digest).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn dedupe_invariant() {
        let (dir, store) = make_store();
        let data = b"duplicate me";
        let d1 = store.put(data).await.unwrap();
        let d2 = store.put(data).await.unwrap();
        assert_eq!(d1, d2);

        // Single file on disk.
        let shard = dir.path().join("objects").join(&d1.as_str()[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn empty_blob() {
        let (_dir, store) = make_store();
        let digest = store.put(b"").await.unwrap();
        assert_eq!(store.get(&digest).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn get_nonexistent_returns_not_found() {
        let (_dir, store) = make_store();
        let fake = ContentDigest::from_bytes(b"no such blob");
        match store.get(&fake).await {
            Err(StorageError::NotFound { digest }) => assert_eq!(digest, fake.as_str()),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_then_missing() {
        let (_dir, store) = make_store();
        let digest = store.put(b"short lived").await.unwrap();
        assert!(store.contains(&digest).await.unwrap());
        store.delete(&digest).await.unwrap();
        assert!(!store.contains(&digest).await.unwrap());
        // deleting again is a no-op
        store.delete(&digest).await.unwrap();
    }

    #[tokio::test]
    async fn reopen_sees_existing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let digest = FsBlobStore::new(dir.path())
            .unwrap()
            .put(b"persisted")
            .await
            .unwrap();
        let reopened = FsBlobStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get(&digest).await.unwrap(), b"persisted");
    }
}
