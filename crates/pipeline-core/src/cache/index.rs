//! The cache index: which blob holds the artifact for each `(stage, fingerprint)`.
//!
//! Persisted as `index.json` next to the blob store and rewritten atomically
//! (temp file + rename) after every change. Writers on one cache directory,
//! in this process or another, serialize on an exclusive lock of
//! `index.lock` and reload the index under it before changing anything.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use pipeline_state::{ContentDigest, StorageResult};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::fingerprint::Fingerprint;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub stage: String,
    pub fingerprint: Fingerprint,
    pub digest: ContentDigest,
    pub size: u64,
    /// Tar archive of declared outputs (true) or captured stdout (false)
    pub archive: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Logical clock value of the last access; drives LRU ordering
    pub last_used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    clock: u64,
    #[serde(default)]
    entries: BTreeMap<String, IndexEntry>,
}

/// Size limits applied after each insert. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl CacheIndex {
    /// Read the index at `path`. A missing file is an empty index; an
    /// unreadable one is discarded with a warning.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CacheIndex>(&text) {
            Ok(index) if index.version == INDEX_VERSION => Ok(index),
            Ok(index) => {
                warn!(path = %path.display(), version = index.version, "ignoring cache index with unknown version");
                Ok(Self::empty())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt cache index");
                Ok(Self::empty())
            }
        }
    }

    pub fn empty() -> Self {
        Self {
            version: INDEX_VERSION,
            clock: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark `key` as most recently used.
    pub fn touch(&mut self, key: &str) {
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = now;
            entry.last_used_at = Utc::now();
        }
    }

    pub fn insert(&mut self, key: String, mut entry: IndexEntry) {
        entry.last_used = self.tick();
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn references(&self, digest: &ContentDigest) -> bool {
        self.entries.values().any(|e| &e.digest == digest)
    }

    /// Bytes held by distinct blobs.
    pub fn total_bytes(&self) -> u64 {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .filter(|e| seen.insert(&e.digest))
            .map(|e| e.size)
            .sum()
    }

    fn over(&self, limits: &CacheLimits) -> bool {
        limits.max_entries.is_some_and(|max| self.len() > max)
            || limits.max_bytes.is_some_and(|max| self.total_bytes() > max)
    }

    /// Evict least-recently-used entries until `limits` hold.
    ///
    /// Entries with a live lease and `keep` are never evicted; if only those
    /// remain the index is left over its limit. Returns the evicted entries.
    pub fn evict(
        &mut self,
        limits: &CacheLimits,
        leases: &HashMap<String, usize>,
        keep: &str,
    ) -> Vec<IndexEntry> {
        let mut evicted = Vec::new();
        while self.over(limits) {
            let victim = self
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep && !leases.contains_key(k.as_str()))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim.and_then(|k| self.entries.remove(&k)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }
}

/// Exclusive hold on a cache directory's index. Released on drop.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    /// Block until the lock file at `path` is exclusively held.
    pub fn acquire(path: &Path) -> StorageResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release cache index lock");
        }
    }
}

/// Take the index lock, then read the current index from disk.
pub fn lock_and_load(lock_path: &Path, index_path: &Path) -> StorageResult<(IndexLock, CacheIndex)> {
    let lock = IndexLock::acquire(lock_path)?;
    let index = CacheIndex::load(index_path)?;
    Ok((lock, index))
}

/// Replace `path` with `bytes` via a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stage: &str, digest_seed: &[u8], size: u64) -> IndexEntry {
        IndexEntry {
            stage: stage.to_string(),
            fingerprint: "0".repeat(64).parse().unwrap(),
            digest: ContentDigest::from_bytes(digest_seed),
            size,
            archive: false,
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            last_used: 0,
        }
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut index = CacheIndex::empty();
        index.insert("a".into(), entry("a", b"a", 10));
        index.insert("b".into(), entry("b", b"b", 10));
        index.insert("c".into(), entry("c", b"c", 10));
        index.touch("a");

        let limits = CacheLimits {
            max_entries: Some(2),
            max_bytes: None,
        };
        let evicted = index.evict(&limits, &HashMap::new(), "c");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].stage, "b");
        assert!(index.get("a").is_some());
    }

    #[test]
    fn test_leased_entries_survive() {
        let mut index = CacheIndex::empty();
        index.insert("a".into(), entry("a", b"a", 10));
        index.insert("b".into(), entry("b", b"b", 10));

        let leases = HashMap::from([("a".to_string(), 1usize)]);
        let limits = CacheLimits {
            max_entries: Some(0),
            max_bytes: None,
        };
        let evicted = index.evict(&limits, &leases, "b");
        assert!(evicted.is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_shared_blobs_count_once() {
        let mut index = CacheIndex::empty();
        index.insert("a".into(), entry("a", b"same", 100));
        index.insert("b".into(), entry("b", b"same", 100));
        assert_eq!(index.total_bytes(), 100);
    }

    #[test]
    fn test_persist_roundtrip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = CacheIndex::empty();
        index.insert("lock/x".into(), entry("lock", b"x", 1));
        write_atomic(&path, &index.to_bytes().unwrap()).unwrap();
        let loaded = CacheIndex::load(&path).unwrap();
        assert_eq!(loaded.get("lock/x"), index.get("lock/x"));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(CacheIndex::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_index_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let held = IndexLock::acquire(&path).unwrap();

        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());
        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
    }
}
