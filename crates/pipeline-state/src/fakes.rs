//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBlobStore` and `MemoryRunLog` that satisfy the trait
//! contracts without touching the filesystem.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let mut store = self.store.lock().unwrap();
        store.remove(digest.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LogState {
    records: HashMap<String, RunRecord>,
    /// Record IDs in start order
    opened: Vec<RecordId>,
    /// Record IDs in completion order
    finalized: Vec<RecordId>,
}

/// In-memory run log preserving open and completion order.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    state: Mutex<LogState>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn open(&self, new: NewRunRecord) -> StorageResult<RecordId> {
        let record_id = RecordId::new();
        let record = RunRecord::open(record_id.clone(), new);
        let mut state = self.state.lock().unwrap();
        state.records.insert(record_id.0.clone(), record);
        state.opened.push(record_id.clone());
        Ok(record_id)
    }

    async fn finalize(
        &self,
        record_id: &RecordId,
        completion: RecordCompletion,
    ) -> StorageResult<RunRecord> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&record_id.0)
            .ok_or_else(|| StorageError::RecordNotFound {
                record_id: record_id.0.clone(),
            })?;
        record.finalize(completion)?;
        let done = record.clone();
        state.finalized.push(record_id.clone());
        Ok(done)
    }

    async fn get(&self, record_id: &RecordId) -> StorageResult<RunRecord> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(&record_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                record_id: record_id.0.clone(),
            })
    }

    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<RunRecord>> {
        let state = self.state.lock().unwrap();
        let finalized = state.finalized.iter();
        let still_open = state
            .opened
            .iter()
            .filter(|id| !state.records[&id.0].is_finalized());
        let ordered = finalized
            .chain(still_open)
            .map(|id| state.records[&id.0].clone());
        Ok(filter.apply(ordered))
    }
}
