//! Storage trait definitions for the pipeline
//!
//! These traits define the persistence abstractions:
//! - `BlobStore`: content-addressed storage for artifact bytes
//! - `RunLog`: append-only log of stage execution attempts
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// BlobStore: content-addressed storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;

    /// Delete content by digest. No-op if absent.
    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// RunLog: stage execution records
// ---------------------------------------------------------------------------

/// Unique identifier of a single run record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    /// Generate a new random RecordId
    pub fn new() -> Self {
        RecordId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Unavailable,
    Cancelled,
    CacheWriteFailed,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Succeeded => "succeeded",
            RecordOutcome::Failed => "failed",
            RecordOutcome::TimedOut => "timed_out",
            RecordOutcome::Unavailable => "unavailable",
            RecordOutcome::Cancelled => "cancelled",
            RecordOutcome::CacheWriteFailed => "cache_write_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RecordOutcome::Succeeded),
            "failed" => Some(RecordOutcome::Failed),
            "timed_out" => Some(RecordOutcome::TimedOut),
            "unavailable" => Some(RecordOutcome::Unavailable),
            "cancelled" => Some(RecordOutcome::Cancelled),
            "cache_write_failed" => Some(RecordOutcome::CacheWriteFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields known when a stage attempt starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRunRecord {
    /// Pipeline invocation this attempt belongs to
    pub run_id: String,
    pub stage_id: String,
    /// Stage fingerprint (hex)
    pub fingerprint: String,
    /// 1-indexed attempt number
    pub attempt: u32,
}

/// Fields known when a stage attempt finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCompletion {
    pub outcome: RecordOutcome,
    pub exit_code: Option<i32>,
    /// Captured output, already truncated
    pub output: String,
    pub output_truncated: bool,
}

impl RecordCompletion {
    /// Build a completion, keeping at most `limit` bytes of the output tail.
    pub fn new(outcome: RecordOutcome, exit_code: Option<i32>, output: &str, limit: usize) -> Self {
        let (output, output_truncated) = truncate_output(output, limit);
        Self {
            outcome,
            exit_code,
            output,
            output_truncated,
        }
    }
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub record_id: RecordId,
    pub run_id: String,
    pub stage_id: String,
    pub fingerprint: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub outcome: Option<RecordOutcome>,
    pub output: String,
    pub output_truncated: bool,
}

impl RunRecord {
    /// Create an open record from start-time fields.
    pub fn open(record_id: RecordId, new: NewRunRecord) -> Self {
        Self {
            record_id,
            run_id: new.run_id,
            stage_id: new.stage_id,
            fingerprint: new.fingerprint,
            attempt: new.attempt,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            outcome: None,
            output: String::new(),
            output_truncated: false,
        }
    }

    /// Whether the record has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Apply a completion. Fails if the record is already finalized.
    pub fn finalize(&mut self, completion: RecordCompletion) -> StorageResult<()> {
        if self.is_finalized() {
            return Err(StorageError::AlreadyFinalized {
                record_id: self.record_id.0.clone(),
            });
        }
        self.finished_at = Some(Utc::now());
        self.outcome = Some(completion.outcome);
        self.exit_code = completion.exit_code;
        self.output = completion.output;
        self.output_truncated = completion.output_truncated;
        Ok(())
    }

    /// Wall-clock duration, if finalized.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Filter for listing run records
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub stage_id: Option<String>,
    pub run_id: Option<String>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.stage_id
            .as_deref()
            .map(|s| record.stage_id == s)
            .unwrap_or(true)
            && self
                .run_id
                .as_deref()
                .map(|r| record.run_id == r)
                .unwrap_or(true)
    }

    /// Apply the filter to records already in log order.
    pub fn apply(&self, records: impl IntoIterator<Item = RunRecord>) -> Vec<RunRecord> {
        let mut out: Vec<RunRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(limit) = self.limit {
            if out.len() > limit {
                out.drain(..out.len() - limit);
            }
        }
        out
    }
}

/// Append-only run record log.
///
/// Guarantees:
/// - A record is created open by `open` and finalized exactly once.
/// - Finalized records are immutable.
/// - `list` returns finalized records in completion order, followed by
///   records still open in start order.
#[async_trait]
pub trait RunLog: Send + Sync {
    /// Append a new open record, returning its ID.
    async fn open(&self, new: NewRunRecord) -> StorageResult<RecordId>;

    /// Finalize an open record. Fails with `AlreadyFinalized` on the second call.
    async fn finalize(
        &self,
        record_id: &RecordId,
        completion: RecordCompletion,
    ) -> StorageResult<RunRecord>;

    /// Retrieve a record by ID.
    async fn get(&self, record_id: &RecordId) -> StorageResult<RunRecord>;

    /// List records matching `filter`.
    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<RunRecord>>;
}

/// Keep at most `limit` bytes of the tail of `output`, on a char boundary.
///
/// Returns the kept text and whether anything was dropped.
pub fn truncate_output(output: &str, limit: usize) -> (String, bool) {
    if output.len() <= limit {
        return (output.to_string(), false);
    }
    let mut start = output.len() - limit;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    (output[start..].to_string(), true)
}
