//! JSON-lines run log.
//!
//! Every state change is appended as one line; the file is never rewritten.
//! On load the lines are replayed to rebuild the in-memory index. A torn
//! final line (crash mid-append) is skipped with a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{
    NewRunRecord, RecordCompletion, RecordFilter, RecordId, RunLog, RunRecord, StorageResult,
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    Opened { record: RunRecord },
    Finalized { record: RunRecord },
}

#[derive(Debug, Default)]
struct Index {
    records: HashMap<String, RunRecord>,
    opened: Vec<RecordId>,
    finalized: Vec<RecordId>,
}

impl Index {
    fn apply(&mut self, line: LogLine) {
        match line {
            LogLine::Opened { record } => {
                self.opened.push(record.record_id.clone());
                self.records.insert(record.record_id.0.clone(), record);
            }
            LogLine::Finalized { record } => {
                self.finalized.push(record.record_id.clone());
                self.records.insert(record.record_id.0.clone(), record);
            }
        }
    }
}

/// Append-only run log stored as JSON lines at `path`.
#[derive(Debug)]
pub struct FileRunLog {
    path: PathBuf,
    index: Mutex<Index>,
}

impl FileRunLog {
    /// Load (or create) the log at `path`, replaying existing lines.
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut index = Index::default();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogLine>(line) {
                        Ok(entry) => index.apply(entry),
                        Err(e) => warn!(
                            path = %path.display(),
                            line = lineno + 1,
                            error = %e,
                            "skipping unreadable run log line"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        debug!(path = %path.display(), records = index.records.len(), "run log loaded");
        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &LogLine) -> StorageResult<()> {
        let mut encoded = serde_json::to_vec(line)?;
        encoded.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RunLog for FileRunLog {
    async fn open(&self, new: NewRunRecord) -> StorageResult<RecordId> {
        let record_id = RecordId::new();
        let record = RunRecord::open(record_id.clone(), new);
        let mut index = self.index.lock().await;
        let line = LogLine::Opened { record };
        self.append(&line).await?;
        index.apply(line);
        Ok(record_id)
    }

    async fn finalize(
        &self,
        record_id: &RecordId,
        completion: RecordCompletion,
    ) -> StorageResult<RunRecord> {
        let mut index = self.index.lock().await;
        let mut record = index
            .records
            .get(&record_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                record_id: record_id.0.clone(),
            })?;
        record.finalize(completion)?;
        let line = LogLine::Finalized {
            record: record.clone(),
        };
        self.append(&line).await?;
        index.apply(line);
        Ok(record)
    }

    async fn get(&self, record_id: &RecordId) -> StorageResult<RunRecord> {
        let index = self.index.lock().await;
        index
            .records
            .get(&record_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RecordNotFound {
                record_id: record_id.0.clone(),
            })
    }

    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<RunRecord>> {
        let index = self.index.lock().await;
        let still_open = index
            .opened
            .iter()
            .filter(|id| !index.records[&id.0].is_finalized());
        let ordered = index
            .finalized
            .iter()
            .chain(still_open)
            .map(|id| index.records[&id.0].clone());
        Ok(filter.apply(ordered))
    }
}
