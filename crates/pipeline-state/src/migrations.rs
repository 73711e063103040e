//! SurrealDB schema initialization for the run record log.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all pipeline tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing pipeline SurrealDB schema");
    init_run_records_table(db).await?;
    Ok(())
}

/// Initialize `run_records` table
///
/// Schema:
/// ```text
/// TABLE run_records {
///   record_id:         STRING (unique)
///   run_id:            STRING (indexed)
///   stage_id:          STRING (indexed)
///   fingerprint:       STRING
///   attempt:           INT
///   started_at:        DATETIME
///   finished_at:       DATETIME?
///   exit_code:         INT?
///   outcome:           STRING?
///   output:            STRING
///   output_truncated:  BOOL
/// }
/// ```
///
/// Records are never deleted; `finished_at` is written once (enforced via app logic).
async fn init_run_records_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing run_records table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_records
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_record_id ON TABLE run_records COLUMNS record_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_stage_id ON TABLE run_records COLUMNS stage_id;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE run_records COLUMNS run_id;
        DEFINE INDEX IF NOT EXISTS idx_stage_fingerprint ON TABLE run_records COLUMNS stage_id, fingerprint;
    "#;

    db.query(sql).await?;
    debug!("run_records table initialized");
    Ok(())
}
