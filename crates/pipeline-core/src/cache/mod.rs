//! Content-addressed artifact cache keyed by `(stage, fingerprint)`.
//!
//! Artifact bytes live in a [`BlobStore`] under their own SHA-256 digest; the
//! [`CacheIndex`] maps cache keys to digests and tracks LRU order. Several
//! keys may share a blob, which is deleted only once no key references it.
//!
//! Concurrency:
//! - index and stats sit behind one async mutex; blob writes and deletes
//!   happen under it so eviction never races an insert of the same blob
//! - on disk, every change takes the `index.lock` file lock and reloads
//!   `index.json` first, so handles in other processes never lose entries
//! - `lock(key)` hands out an exclusive per-key guard for populators
//! - `lease(key)` pins an entry against eviction until the lease drops

mod index;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use pipeline_state::fakes::MemoryBlobStore;
use pipeline_state::{BlobStore, ContentDigest, FsBlobStore, StorageError};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub use index::{CacheIndex, CacheLimits, IndexEntry, IndexLock};

use crate::fingerprint::Fingerprint;

/// Cache failures carry the key they concern.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache read failed for {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("cache write failed for {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StorageError,
    },
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub stage: String,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn new(stage: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            stage: stage.into(),
            fingerprint,
        }
    }

    fn index_key(&self) -> String {
        format!("{}/{}", self.stage, self.fingerprint)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.stage, self.fingerprint.short())
    }
}

/// Immutable output of a successful stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub stage: String,
    pub fingerprint: Fingerprint,
    pub digest: ContentDigest,
    pub bytes: Vec<u8>,
    /// Tar archive of declared outputs (true) or captured stdout (false)
    pub archive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheState {
    index: CacheIndex,
    counters: Counters,
}

/// Where a persistent cache keeps its index and the lock guarding it.
#[derive(Debug, Clone)]
struct IndexFiles {
    index: PathBuf,
    lock: PathBuf,
}

type LeaseTable = Arc<StdMutex<HashMap<String, usize>>>;
type KeyLockTable = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Exclusive right to populate one cache key.
///
/// The key's slot is dropped from the lock table once no one holds or
/// waits on it.
pub struct KeyGuard {
    key: String,
    table: KeyLockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let slot = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);

        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the table and `slot` still point at the mutex.
        let idle = table
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
            && Arc::strong_count(&slot) == 2;
        if idle {
            table.remove(&self.key);
        }
    }
}

/// Pins a cache entry against eviction while alive.
#[derive(Debug)]
pub struct Lease {
    key: String,
    table: LeaseTable,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(count) = table.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    table.remove(&self.key);
                }
            }
        }
    }
}

pub struct ArtifactCache {
    blobs: Arc<dyn BlobStore>,
    /// `None` keeps the index in memory only
    files: Option<IndexFiles>,
    limits: CacheLimits,
    state: Mutex<CacheState>,
    leases: LeaseTable,
    key_locks: KeyLockTable,
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("files", &self.files)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Open the on-disk cache rooted at `dir` (`objects/`, `index.json` and
    /// `index.lock`).
    pub fn open(dir: impl AsRef<Path>, limits: CacheLimits) -> CacheResult<Self> {
        let dir = dir.as_ref();
        let read_err = |source| CacheError::Read {
            key: "<index>".to_string(),
            source,
        };
        let blobs = FsBlobStore::new(dir).map_err(read_err)?;
        let files = IndexFiles {
            index: dir.join("index.json"),
            lock: dir.join("index.lock"),
        };
        let index = CacheIndex::load(&files.index).map_err(read_err)?;
        debug!(dir = %dir.display(), entries = index.len(), "opened artifact cache");
        Ok(Self::from_parts(Arc::new(blobs), Some(files), index, limits))
    }

    /// Cache over an arbitrary blob store with an in-memory index.
    pub fn with_store(blobs: Arc<dyn BlobStore>, limits: CacheLimits) -> Self {
        Self::from_parts(blobs, None, CacheIndex::empty(), limits)
    }

    /// Fully in-memory cache, for tests and dry runs.
    pub fn in_memory(limits: CacheLimits) -> Self {
        Self::with_store(Arc::new(MemoryBlobStore::new()), limits)
    }

    fn from_parts(
        blobs: Arc<dyn BlobStore>,
        files: Option<IndexFiles>,
        index: CacheIndex,
        limits: CacheLimits,
    ) -> Self {
        Self {
            blobs,
            files,
            limits,
            state: Mutex::new(CacheState {
                index,
                counters: Counters::default(),
            }),
            leases: Arc::new(StdMutex::new(HashMap::new())),
            key_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    /// Take the on-disk index lock and replace the in-memory index with the
    /// persisted one. The change must be persisted before the lock drops.
    async fn begin_write(&self, state: &mut CacheState) -> Result<Option<IndexLock>, StorageError> {
        let Some(files) = self.files.clone() else {
            return Ok(None);
        };
        let (lock, index) = tokio::task::spawn_blocking(move || index::lock_and_load(&files.lock, &files.index))
            .await
            .map_err(|e| StorageError::Backend(format!("index loader panicked: {e}")))??;
        state.index = index;
        Ok(Some(lock))
    }

    /// Pick up entries persisted by other handles on the same directory.
    async fn refresh(&self, state: &mut CacheState) -> Result<(), StorageError> {
        let Some(files) = self.files.clone() else {
            return Ok(());
        };
        state.index = tokio::task::spawn_blocking(move || CacheIndex::load(&files.index))
            .await
            .map_err(|e| StorageError::Backend(format!("index loader panicked: {e}")))??;
        Ok(())
    }

    async fn persist(&self, index: &CacheIndex) -> Result<(), StorageError> {
        let Some(files) = self.files.clone() else {
            return Ok(());
        };
        let bytes = index.to_bytes()?;
        tokio::task::spawn_blocking(move || index::write_atomic(&files.index, &bytes))
            .await
            .map_err(|e| StorageError::Backend(format!("index writer panicked: {e}")))?
    }

    fn lease_table(&self) -> HashMap<String, usize> {
        self.leases.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Fetch the artifact for `key`, counting a hit or miss.
    ///
    /// An index entry whose blob vanished or no longer matches its digest is
    /// dropped and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<Artifact>> {
        let k = key.index_key();
        let mut state = self.state.lock().await;
        let _lock = self
            .begin_write(&mut state)
            .await
            .map_err(|source| CacheError::Read { key: k.clone(), source })?;

        let Some(entry) = state.index.get(&k).cloned() else {
            state.counters.misses += 1;
            return Ok(None);
        };

        match self.blobs.get(&entry.digest).await {
            Ok(bytes) if ContentDigest::from_bytes(&bytes) == entry.digest => {
                state.counters.hits += 1;
                state.index.touch(&k);
                if let Err(e) = self.persist(&state.index).await {
                    warn!(key = %key, error = %e, "failed to record cache access");
                }
                Ok(Some(Artifact {
                    stage: entry.stage,
                    fingerprint: entry.fingerprint,
                    digest: entry.digest,
                    bytes,
                    archive: entry.archive,
                }))
            }
            Ok(_) | Err(StorageError::NotFound { .. }) => {
                warn!(key = %key, digest = %entry.digest.short(), "cached blob missing or corrupt; treating as miss");
                state.index.remove(&k);
                state.counters.misses += 1;
                if !state.index.references(&entry.digest) {
                    let _ = self.blobs.delete(&entry.digest).await;
                }
                if let Err(e) = self.persist(&state.index).await {
                    warn!(key = %key, error = %e, "failed to drop stale cache entry");
                }
                Ok(None)
            }
            Err(source) => Err(CacheError::Read { key: k, source }),
        }
    }

    /// Whether `key` has a stored artifact. Does not count as an access.
    pub async fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        let k = key.index_key();
        let mut state = self.state.lock().await;
        self.refresh(&mut state)
            .await
            .map_err(|source| CacheError::Read { key: k.clone(), source })?;
        match state.index.get(&k) {
            None => Ok(false),
            Some(entry) => self
                .blobs
                .contains(&entry.digest)
                .await
                .map_err(|source| CacheError::Read { key: k, source }),
        }
    }

    /// Store `bytes` as the artifact for `key`.
    ///
    /// If the key is already populated, here or by another handle on the
    /// same directory, the new bytes are discarded and the stored artifact
    /// is returned. Eviction runs afterwards. A failed write leaves the
    /// index as it was.
    pub async fn put(&self, key: &CacheKey, bytes: Vec<u8>, archive: bool) -> CacheResult<Artifact> {
        let k = key.index_key();
        let write_err = |source| CacheError::Write {
            key: k.clone(),
            source,
        };
        let mut state = self.state.lock().await;
        let _lock = self.begin_write(&mut state).await.map_err(write_err)?;

        if let Some(existing) = state.index.get(&k).cloned() {
            if let Ok(stored) = self.blobs.get(&existing.digest).await {
                if ContentDigest::from_bytes(&stored) == existing.digest {
                    debug!(key = %key, "cache key already populated; adopting stored artifact");
                    state.index.touch(&k);
                    if let Err(e) = self.persist(&state.index).await {
                        warn!(key = %key, error = %e, "failed to record cache access");
                    }
                    return Ok(Artifact {
                        stage: existing.stage,
                        fingerprint: existing.fingerprint,
                        digest: existing.digest,
                        bytes: stored,
                        archive: existing.archive,
                    });
                }
            }
        }

        let digest = self.blobs.put(&bytes).await.map_err(write_err)?;
        let previous = state.index.clone();
        let now = Utc::now();
        state.index.insert(
            k.clone(),
            IndexEntry {
                stage: key.stage.clone(),
                fingerprint: key.fingerprint.clone(),
                digest: digest.clone(),
                size: bytes.len() as u64,
                archive,
                created_at: now,
                last_used_at: now,
                last_used: 0,
            },
        );

        let leases = self.lease_table();
        let evicted = state.index.evict(&self.limits, &leases, &k);

        if let Err(source) = self.persist(&state.index).await {
            state.index = previous;
            if !state.index.references(&digest) {
                let _ = self.blobs.delete(&digest).await;
            }
            return Err(write_err(source));
        }

        for victim in &evicted {
            state.counters.evictions += 1;
            info!(stage = %victim.stage, fingerprint = %victim.fingerprint.short(), size = victim.size, "evicted cached artifact");
            if !state.index.references(&victim.digest) {
                if let Err(e) = self.blobs.delete(&victim.digest).await {
                    warn!(digest = %victim.digest.short(), error = %e, "failed to delete evicted blob");
                }
            }
        }
        debug!(key = %key, digest = %digest.short(), size = bytes.len(), "cached artifact");

        Ok(Artifact {
            stage: key.stage.clone(),
            fingerprint: key.fingerprint.clone(),
            digest,
            bytes,
            archive,
        })
    }

    /// Exclusive per-key guard. Concurrent populators of one key serialize
    /// on it; unrelated keys never contend.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        let k = key.index_key();
        let slot = {
            let mut locks = self
                .key_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(k.clone()).or_default().clone()
        };
        KeyGuard {
            key: k,
            table: Arc::clone(&self.key_locks),
            guard: Some(slot.lock_owned().await),
        }
    }

    /// Pin `key` against eviction until the returned lease is dropped.
    pub fn lease(&self, key: &CacheKey) -> Lease {
        let k = key.index_key();
        let mut table = self
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *table.entry(k.clone()).or_insert(0) += 1;
        Lease {
            key: k,
            table: Arc::clone(&self.leases),
        }
    }

    /// Number of live leases on `key`.
    pub fn lease_count(&self, key: &CacheKey) -> usize {
        self.lease_table().get(&key.index_key()).copied().unwrap_or(0)
    }

    pub async fn stats(&self) -> CacheStats {
        let mut state = self.state.lock().await;
        if let Err(e) = self.refresh(&mut state).await {
            warn!(error = %e, "could not reload cache index; reporting last known state");
        }
        CacheStats {
            entries: state.index.len(),
            bytes: state.index.total_bytes(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            evictions: state.counters.evictions,
        }
    }

    /// Remove every unleased entry. Returns how many were removed.
    pub async fn clear(&self) -> CacheResult<usize> {
        let index_err = |source| CacheError::Write {
            key: "<index>".to_string(),
            source,
        };
        let mut state = self.state.lock().await;
        let _lock = self.begin_write(&mut state).await.map_err(index_err)?;

        let leases = self.lease_table();
        let victims: Vec<String> = state
            .index
            .entries()
            .filter(|(k, _)| !leases.contains_key(k.as_str()))
            .map(|(k, _)| k.clone())
            .collect();

        let previous = state.index.clone();
        let removed: Vec<(String, IndexEntry)> = victims
            .iter()
            .filter_map(|k| state.index.remove(k).map(|entry| (k.clone(), entry)))
            .collect();
        if let Err(source) = self.persist(&state.index).await {
            state.index = previous;
            return Err(index_err(source));
        }

        for (k, entry) in &removed {
            if !state.index.references(&entry.digest) {
                self.blobs
                    .delete(&entry.digest)
                    .await
                    .map_err(|source| CacheError::Write {
                        key: k.clone(),
                        source,
                    })?;
            }
        }
        info!(removed = removed.len(), "cleared artifact cache");
        Ok(removed.len())
    }
}
