//! SurrealDB-backed RunLog implementation
//!
//! Rows live in the `run_records` table and are converted to/from
//! `storage_traits::RunRecord` at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{
    NewRunRecord, RecordCompletion, RecordFilter, RecordId, RecordOutcome, RunLog, RunRecord,
    StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format.
mod surreal_dt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format.
mod surreal_dt_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row stored in the `run_records` table
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    record_id: String,
    run_id: String,
    stage_id: String,
    fingerprint: String,
    attempt: u32,
    #[serde(with = "surreal_dt")]
    started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_dt_opt")]
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    outcome: Option<String>,
    output: String,
    output_truncated: bool,
}

impl DbRecord {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            id: None,
            record_id: record.record_id.0.clone(),
            run_id: record.run_id.clone(),
            stage_id: record.stage_id.clone(),
            fingerprint: record.fingerprint.clone(),
            attempt: record.attempt,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            outcome: record.outcome.map(|o| o.as_str().to_string()),
            output: record.output.clone(),
            output_truncated: record.output_truncated,
        }
    }

    fn into_record(self) -> StorageResult<RunRecord> {
        let outcome = match self.outcome {
            Some(s) => Some(RecordOutcome::parse(&s).ok_or_else(|| {
                StorageError::Backend(format!("unknown record outcome: {s}"))
            })?),
            None => None,
        };
        Ok(RunRecord {
            record_id: RecordId(self.record_id),
            run_id: self.run_id,
            stage_id: self.stage_id,
            fingerprint: self.fingerprint,
            attempt: self.attempt,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            outcome,
            output: self.output,
            output_truncated: self.output_truncated,
        })
    }
}

/// SurrealDB-backed implementation of [`RunLog`].
pub struct SurrealRunLog {
    db: Surreal<Any>,
}

impl SurrealRunLog {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to `url` (`mem://`, `surrealkv://<path>`, `ws://host:port`, ...).
    ///
    /// When `PIPELINE_RUNLOG_USER` and `PIPELINE_RUNLOG_PASS` are both set the
    /// connection signs in as root before selecting the namespace.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect to {url}: {e}")))?;

        if let (Ok(username), Ok(password)) = (
            std::env::var("PIPELINE_RUNLOG_USER"),
            std::env::var("PIPELINE_RUNLOG_PASS"),
        ) {
            db.signin(Root {
                username: &username,
                password: &password,
            })
            .await
            .map_err(|e| StorageError::Backend(format!("root auth failed: {e}")))?;
        }

        db.use_ns("pipeline").use_db("main").await?;
        migrations::init_schema(&db).await?;

        info!(url = %url, "SurrealRunLog connected");
        Ok(Self { db })
    }

    async fn fetch(&self, rid: &str) -> StorageResult<DbRecord> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM run_records WHERE record_id = $rid")
            .bind(("rid", rid_owned))
            .await?;

        let rows: Vec<DbRecord> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RecordNotFound {
                record_id: rid.to_string(),
            })
    }
}

#[async_trait]
impl RunLog for SurrealRunLog {
    async fn open(&self, new: NewRunRecord) -> StorageResult<RecordId> {
        let record_id = RecordId::new();
        let record = RunRecord::open(record_id.clone(), new);
        debug!(record_id = %record_id, stage = %record.stage_id, "opening run record");

        let _created: Option<DbRecord> = self
            .db
            .create("run_records")
            .content(DbRecord::from_record(&record))
            .await?;

        Ok(record_id)
    }

    async fn finalize(
        &self,
        record_id: &RecordId,
        completion: RecordCompletion,
    ) -> StorageResult<RunRecord> {
        let mut record = self.fetch(&record_id.0).await?.into_record()?;
        record.finalize(completion)?;
        let row = DbRecord::from_record(&record);

        self.db
            .query(
                "UPDATE run_records SET \
                 finished_at = $finished_at, \
                 exit_code = $exit_code, \
                 outcome = $outcome, \
                 output = $output, \
                 output_truncated = $output_truncated \
                 WHERE record_id = $rid AND finished_at = NONE",
            )
            .bind((
                "finished_at",
                row.finished_at.map(surrealdb::sql::Datetime::from),
            ))
            .bind(("exit_code", row.exit_code))
            .bind(("outcome", row.outcome))
            .bind(("output", row.output))
            .bind(("output_truncated", row.output_truncated))
            .bind(("rid", row.record_id))
            .await?;

        Ok(record)
    }

    async fn get(&self, record_id: &RecordId) -> StorageResult<RunRecord> {
        self.fetch(&record_id.0).await?.into_record()
    }

    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<RunRecord>> {
        let mut res = self.db.query("SELECT * FROM run_records").await?;
        let rows: Vec<DbRecord> = res.take(0)?;

        let mut records = rows
            .into_iter()
            .map(DbRecord::into_record)
            .collect::<StorageResult<Vec<_>>>()?;

        // Finalized by completion time, then open ones by start time.
        records.sort_by(|a, b| match (a.finished_at, b.finished_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.started_at.cmp(&b.started_at),
        });

        Ok(filter.apply(records))
    }
}
