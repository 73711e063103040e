//! Pipeline-State: persistence for the build pipeline
//!
//! Everything the orchestrator keeps on disk between invocations lives here:
//!
//! - `BlobStore`: content-addressed artifact bytes (`FsBlobStore`, `MemoryBlobStore`)
//! - `RunLog`: append-only run records (`FileRunLog`, `SurrealRunLog`, `MemoryRunLog`)
//!
//! Layer 0 of the workspace: it knows nothing about stages or graphs, only
//! digests, records and bytes.

mod error;
pub mod fakes;
mod file_log;
mod fs_blob;
mod migrations;
pub mod storage_traits;
pub mod surreal_log;

pub use error::StorageError;
pub use file_log::FileRunLog;
pub use fs_blob::FsBlobStore;
pub use storage_traits::{
    truncate_output, BlobStore, ContentDigest, NewRunRecord, RecordCompletion, RecordFilter,
    RecordId, RecordOutcome, RunLog, RunRecord, StorageResult,
};
pub use surreal_log::SurrealRunLog;
