//! Batch lifecycle persistence (SQLite).
//!
//! Three tables:
//!
//! - `active_batches`: one row per batch in flight
//! - `batch_history`: immutable archive, one row per batch that left the
//!   active table
//! - `event_log`: operational events (health findings, fault reports)
//!
//! A batch lives in exactly one of the first two tables. Archival inserts
//! the history row and deletes the active row in one transaction. Updates
//! coming from telemetry are guarded with `manufacturing_complete = 0`, so a
//! completed batch cannot have its consumption data changed.
//!
//! Timestamps are stored as Unix milliseconds.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info};

use crate::batch::{BatchRecord, ComponentLine, HistoryRecord, NewBatch, Outcome};

/// Errors raised by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Component lines could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No active batch with that id or work order.
    #[error("batch not found: {0}")]
    NotFound(String),

    /// Intake wrote a different number of slots than it staged.
    #[error("intake mismatch: {staged} batches staged, {written} slots written")]
    IntakeMismatch {
        /// Rows staged in the transaction.
        staged: usize,
        /// Slots written to the PLC.
        written: usize,
    },

    /// A stored value cannot be mapped back.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Store result type.
pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS active_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_number INTEGER NOT NULL,
    work_order TEXT NOT NULL UNIQUE,
    equipment TEXT NOT NULL,
    components TEXT NOT NULL,
    target_weight REAL NOT NULL,
    actual_weight REAL,
    progress REAL,
    stage_code INTEGER,
    manufacturing_complete INTEGER NOT NULL DEFAULT 0,
    operation_failed INTEGER NOT NULL DEFAULT 0,
    erp_synced INTEGER NOT NULL DEFAULT 0,
    erp_cancel_acked INTEGER NOT NULL DEFAULT 0,
    last_telemetry_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    batch_number INTEGER NOT NULL,
    work_order TEXT NOT NULL,
    equipment TEXT NOT NULL,
    components TEXT NOT NULL,
    target_weight REAL NOT NULL,
    actual_weight REAL,
    progress REAL,
    stage_code INTEGER,
    manufacturing_complete INTEGER NOT NULL,
    operation_failed INTEGER NOT NULL,
    erp_synced INTEGER NOT NULL,
    erp_cancel_acked INTEGER NOT NULL,
    last_telemetry_at INTEGER,
    created_at INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    notes TEXT,
    archived_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_work_order ON batch_history(work_order);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at INTEGER NOT NULL,
    level TEXT NOT NULL,
    kind TEXT NOT NULL,
    work_order TEXT,
    message TEXT NOT NULL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_event_log_at ON event_log(at);
"#;

const BATCH_COLUMNS: &str = "batch_number, work_order, equipment, components, target_weight, \
    actual_weight, progress, stage_code, manufacturing_complete, operation_failed, erp_synced, \
    erp_cancel_acked, last_telemetry_at, created_at";

/// Severity of an event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Informational.
    Info,
    /// Needs attention.
    Warn,
    /// A task failed.
    Error,
}

impl EventLevel {
    fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

/// One event-log row.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Row id.
    pub id: i64,
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// Severity.
    pub level: String,
    /// Event kind, e.g. `stale_telemetry`.
    pub kind: String,
    /// Work order concerned, if any.
    pub work_order: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Structured details as JSON.
    pub details: Option<serde_json::Value>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn hydrate_batch(row: &SqliteRow, id_column: &str) -> Result<BatchRecord> {
    let components: String = row.try_get("components")?;
    let components: Vec<ComponentLine> = serde_json::from_str(&components)?;
    let batch_number: i64 = row.try_get("batch_number")?;
    let stage_code: Option<i64> = row.try_get("stage_code")?;
    let last_telemetry_at: Option<i64> = row.try_get("last_telemetry_at")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(BatchRecord {
        id: row.try_get(id_column)?,
        batch_number: u16::try_from(batch_number)
            .map_err(|_| StoreError::Corrupt(format!("batch number {batch_number}")))?,
        work_order: row.try_get("work_order")?,
        equipment: row.try_get("equipment")?,
        components,
        target_weight: row.try_get("target_weight")?,
        actual_weight: row.try_get("actual_weight")?,
        progress: row.try_get("progress")?,
        stage_code: stage_code.and_then(|c| u16::try_from(c).ok()),
        manufacturing_complete: row.try_get("manufacturing_complete")?,
        operation_failed: row.try_get("operation_failed")?,
        erp_synced: row.try_get("erp_synced")?,
        erp_cancel_acked: row.try_get("erp_cancel_acked")?,
        last_telemetry_at: last_telemetry_at.map(from_millis).transpose()?,
        created_at: from_millis(created_at)?,
    })
}

fn hydrate_history(row: &SqliteRow) -> Result<HistoryRecord> {
    let outcome: String = row.try_get("outcome")?;
    let archived_at: i64 = row.try_get("archived_at")?;
    Ok(HistoryRecord {
        batch: hydrate_batch(row, "batch_id")?,
        outcome: Outcome::from_str(&outcome).map_err(StoreError::Corrupt)?,
        notes: row.try_get("notes")?,
        archived_at: from_millis(archived_at)?,
    })
}

fn hydrate_event(row: &SqliteRow) -> Result<EventRecord> {
    let at: i64 = row.try_get("at")?;
    let details: Option<String> = row.try_get("details")?;
    Ok(EventRecord {
        id: row.try_get("id")?,
        at: from_millis(at)?,
        level: row.try_get("level")?,
        kind: row.try_get("kind")?,
        work_order: row.try_get("work_order")?,
        message: row.try_get("message")?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
    })
}

/// Moves one active row into the history table inside `tx`.
async fn archive_in(
    tx: &mut Transaction<'static, Sqlite>,
    id: i64,
    outcome: Outcome,
    notes: Option<&str>,
) -> Result<HistoryRecord> {
    let insert = format!(
        "INSERT INTO batch_history (batch_id, {BATCH_COLUMNS}, outcome, notes, archived_at) \
         SELECT id, {BATCH_COLUMNS}, ?, ?, ? FROM active_batches WHERE id = ?"
    );
    let result = sqlx::query(&insert)
        .bind(outcome.to_string())
        .bind(notes)
        .bind(now_millis())
        .bind(id)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() != 1 {
        return Err(StoreError::NotFound(format!("id {id}")));
    }
    let history_id = result.last_insert_rowid();

    sqlx::query("DELETE FROM active_batches WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let row = sqlx::query("SELECT * FROM batch_history WHERE id = ?")
        .bind(history_id)
        .fetch_one(&mut **tx)
        .await?;
    hydrate_history(&row)
}

/// Handle on the batch database.
#[derive(Debug, Clone)]
pub struct BatchStore {
    pool: SqlitePool,
}

impl BatchStore {
    /// Opens (creating if needed) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "batch store opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds a single connection that never expires, since each
    /// in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of batches in flight.
    pub async fn count_active(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM active_batches")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Every active batch, by batch number.
    pub async fn list_active(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, {BATCH_COLUMNS} FROM active_batches ORDER BY batch_number, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| hydrate_batch(row, "id")).collect()
    }

    /// Active batches the PLC finished that the ERP has not accepted yet.
    pub async fn list_pending_settlement(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, {BATCH_COLUMNS} FROM active_batches \
             WHERE manufacturing_complete = 1 AND erp_synced = 0 ORDER BY batch_number, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| hydrate_batch(row, "id")).collect()
    }

    /// Active batches the PLC reported as failed.
    pub async fn list_failed(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, {BATCH_COLUMNS} FROM active_batches \
             WHERE operation_failed = 1 ORDER BY batch_number, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| hydrate_batch(row, "id")).collect()
    }

    /// Looks an active batch up by id.
    pub async fn get(&self, id: i64) -> Result<BatchRecord> {
        let row = sqlx::query(&format!(
            "SELECT id, {BATCH_COLUMNS} FROM active_batches WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => hydrate_batch(&row, "id"),
            None => Err(StoreError::NotFound(format!("id {id}"))),
        }
    }

    /// Looks an active batch up by work order.
    pub async fn find_by_work_order(&self, work_order: &str) -> Result<BatchRecord> {
        let row = sqlx::query(&format!(
            "SELECT id, {BATCH_COLUMNS} FROM active_batches WHERE work_order = ?"
        ))
        .bind(work_order)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => hydrate_batch(&row, "id"),
            None => Err(StoreError::NotFound(work_order.to_string())),
        }
    }

    /// Persists telemetry applied to `record` and stamps the telemetry time.
    ///
    /// Returns `false` without writing anything when the stored row is
    /// already complete.
    pub async fn persist_telemetry(&self, record: &BatchRecord) -> Result<bool> {
        let components = serde_json::to_string(&record.components)?;
        let result = sqlx::query(
            r#"
            UPDATE active_batches
            SET components = ?, actual_weight = ?, progress = ?, stage_code = ?,
                manufacturing_complete = ?, operation_failed = ?, last_telemetry_at = ?
            WHERE id = ? AND manufacturing_complete = 0
            "#,
        )
        .bind(components)
        .bind(record.actual_weight)
        .bind(record.progress)
        .bind(record.stage_code.map(i64::from))
        .bind(record.manufacturing_complete)
        .bind(record.operation_failed)
        .bind(now_millis())
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        let written = result.rows_affected() == 1;
        if !written {
            debug!(id = record.id, work_order = %record.work_order, "telemetry update refused: batch frozen");
        }
        Ok(written)
    }

    /// Stamps the telemetry time after a read that changed nothing.
    pub async fn touch_telemetry(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE active_batches SET last_telemetry_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flags an unfinished batch as failed. Returns `false` if the batch is
    /// already complete.
    pub async fn mark_operation_failed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE active_batches SET operation_failed = 1 WHERE id = ? AND manufacturing_complete = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records that the ERP acknowledged the cancellation.
    pub async fn set_cancel_acked(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE active_batches SET erp_cancel_acked = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("id {id}")));
        }
        Ok(())
    }

    /// Moves a batch into history with `outcome`, atomically.
    pub async fn archive(&self, id: i64, outcome: Outcome, notes: Option<&str>) -> Result<HistoryRecord> {
        let mut tx = self.pool.begin().await?;
        let history = archive_in(&mut tx, id, outcome, notes).await?;
        tx.commit().await?;
        info!(id, work_order = %history.batch.work_order, %outcome, "batch archived");
        Ok(history)
    }

    /// Marks a completed batch as synced and archives it as completed, in
    /// one transaction.
    pub async fn settle_and_archive(&self, id: i64, notes: Option<&str>) -> Result<HistoryRecord> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE active_batches SET erp_synced = 1 WHERE id = ? AND manufacturing_complete = 1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::NotFound(format!("completed batch id {id}")));
        }
        let history = archive_in(&mut tx, id, Outcome::Completed, notes).await?;
        tx.commit().await?;
        info!(id, work_order = %history.batch.work_order, "batch settled and archived");
        Ok(history)
    }

    /// Archives every active batch as failed. Returns how many were moved.
    pub async fn clear_active(&self, notes: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let insert = format!(
            "INSERT INTO batch_history (batch_id, {BATCH_COLUMNS}, outcome, notes, archived_at) \
             SELECT id, {BATCH_COLUMNS}, ?, ?, ? FROM active_batches"
        );
        let moved = sqlx::query(&insert)
            .bind(Outcome::Failed.to_string())
            .bind(notes)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM active_batches").execute(&mut *tx).await?;
        tx.commit().await?;
        info!(moved, "active batches cleared");
        Ok(moved)
    }

    /// Most recent history rows, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query("SELECT * FROM batch_history ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_history).collect()
    }

    /// History rows of one work order, newest first.
    pub async fn history_for(&self, work_order: &str) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query("SELECT * FROM batch_history WHERE work_order = ? ORDER BY id DESC")
            .bind(work_order)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_history).collect()
    }

    /// Starts an intake transaction.
    ///
    /// While the returned [`StagedIntake`] is alive it holds a connection;
    /// with an in-memory store that is the only one, so no other store call
    /// may be awaited before it is committed or rolled back.
    pub async fn begin_intake(&self) -> Result<StagedIntake> {
        Ok(StagedIntake {
            tx: self.pool.begin().await?,
            staged: Vec::new(),
        })
    }

    /// Appends an event row.
    pub async fn record_event(
        &self,
        level: EventLevel,
        kind: &str,
        work_order: Option<&str>,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let details = details.map(serde_json::Value::to_string);
        let result = sqlx::query(
            "INSERT INTO event_log (at, level, kind, work_order, message, details) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(now_millis())
        .bind(level.as_str())
        .bind(kind)
        .bind(work_order)
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM event_log ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(hydrate_event).collect()
    }

    /// Newest event recorded against `work_order`.
    pub async fn latest_event_for(&self, work_order: &str) -> Result<Option<EventRecord>> {
        let row = sqlx::query("SELECT * FROM event_log WHERE work_order = ? ORDER BY id DESC LIMIT 1")
            .bind(work_order)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(hydrate_event).transpose()
    }

    /// Deletes events older than `days` days, always keeping the newest
    /// `keep_latest` rows. Returns the number deleted.
    pub async fn prune_events(&self, days: u32, keep_latest: u32) -> Result<u64> {
        let cutoff = now_millis() - i64::from(days) * 86_400_000;
        let result = sqlx::query(
            r#"
            DELETE FROM event_log
            WHERE at < ?
              AND id NOT IN (SELECT id FROM event_log ORDER BY id DESC LIMIT ?)
            "#,
        )
        .bind(cutoff)
        .bind(i64::from(keep_latest))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// An open intake transaction holding staged batches.
///
/// Dropping it without calling [`commit`](Self::commit) rolls everything back.
pub struct StagedIntake {
    tx: Transaction<'static, Sqlite>,
    staged: Vec<BatchRecord>,
}

impl std::fmt::Debug for StagedIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedIntake")
            .field("staged", &self.staged.len())
            .finish_non_exhaustive()
    }
}

impl StagedIntake {
    /// Inserts `batch` into the uncommitted transaction.
    pub async fn stage(&mut self, batch: &NewBatch) -> Result<&BatchRecord> {
        let created_at = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO active_batches (batch_number, work_order, equipment, components, target_weight, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(batch.batch_number))
        .bind(&batch.work_order)
        .bind(&batch.equipment)
        .bind(serde_json::to_string(&batch.components)?)
        .bind(batch.target_weight)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;

        self.staged.push(BatchRecord {
            id: result.last_insert_rowid(),
            batch_number: batch.batch_number,
            work_order: batch.work_order.clone(),
            equipment: batch.equipment.clone(),
            components: batch.components.clone(),
            target_weight: batch.target_weight,
            actual_weight: None,
            progress: None,
            stage_code: None,
            manufacturing_complete: false,
            operation_failed: false,
            erp_synced: false,
            erp_cancel_acked: false,
            last_telemetry_at: None,
            created_at: from_millis(created_at)?,
        });
        Ok(&self.staged[self.staged.len() - 1])
    }

    /// Batches staged so far.
    pub fn staged(&self) -> &[BatchRecord] {
        &self.staged
    }

    /// Commits if exactly every staged batch was written to the PLC.
    ///
    /// # Errors
    ///
    /// [`StoreError::IntakeMismatch`] after rolling back when `written`
    /// differs from the number staged.
    pub async fn commit(self, written: usize) -> Result<Vec<BatchRecord>> {
        let staged = self.staged.len();
        if written != staged {
            self.tx.rollback().await?;
            return Err(StoreError::IntakeMismatch { staged, written });
        }
        self.tx.commit().await?;
        Ok(self.staged)
    }

    /// Discards every staged batch.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ComponentKind;

    fn new_batch(number: u16, work_order: &str) -> NewBatch {
        NewBatch {
            batch_number: number,
            work_order: work_order.to_string(),
            equipment: "MIX01".into(),
            target_weight: 100.0,
            components: vec![ComponentLine {
                kind: ComponentKind::Solid,
                index: 1,
                code: "SUGAR".into(),
                name: None,
                planned: 100.0,
                actual: None,
            }],
        }
    }

    async fn store_with(work_orders: &[&str]) -> (BatchStore, Vec<BatchRecord>) {
        let store = BatchStore::in_memory().await.unwrap();
        let mut intake = store.begin_intake().await.unwrap();
        for (i, wo) in work_orders.iter().enumerate() {
            intake.stage(&new_batch(i as u16 + 1, wo)).await.unwrap();
        }
        let records = intake.commit(work_orders.len()).await.unwrap();
        (store, records)
    }

    #[tokio::test]
    async fn test_commit_persists_staged_rows() {
        let (store, records) = store_with(&["WO-1", "WO-2"]).await;
        assert_eq!(records.len(), 2);
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].work_order, "WO-2");
        assert_eq!(active[0].components[0].code, "SUGAR");
    }

    #[tokio::test]
    async fn test_mismatched_commit_rolls_back() {
        let store = BatchStore::in_memory().await.unwrap();
        let mut intake = store.begin_intake().await.unwrap();
        for i in 1..=3 {
            intake.stage(&new_batch(i, &format!("WO-{i}"))).await.unwrap();
        }
        let err = intake.commit(2).await.unwrap_err();
        assert!(matches!(err, StoreError::IntakeMismatch { staged: 3, written: 2 }));
        assert_eq!(store.count_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_intake_rolls_back() {
        let store = BatchStore::in_memory().await.unwrap();
        {
            let mut intake = store.begin_intake().await.unwrap();
            intake.stage(&new_batch(1, "WO-1")).await.unwrap();
        }
        assert_eq!(store.count_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_frozen_row_refuses_update() {
        let (store, mut records) = store_with(&["WO-1"]).await;
        let mut record = records.remove(0);
        record.actual_weight = Some(99.5);
        record.manufacturing_complete = true;
        assert!(store.persist_telemetry(&record).await.unwrap());

        record.actual_weight = Some(1.0);
        assert!(!store.persist_telemetry(&record).await.unwrap());
        let stored = store.get(record.id).await.unwrap();
        assert_eq!(stored.actual_weight, Some(99.5));
        assert!(stored.last_telemetry_at.is_some());
        assert!(!store.mark_operation_failed(record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_moves_row() {
        let (store, records) = store_with(&["WO-1", "WO-2"]).await;
        store.set_cancel_acked(records[0].id).await.unwrap();

        let history = store
            .archive(records[0].id, Outcome::Cancelled, Some("plc failure"))
            .await
            .unwrap();
        assert_eq!(history.outcome, Outcome::Cancelled);
        assert!(history.batch.erp_cancel_acked);
        assert_eq!(history.batch.id, records[0].id);

        assert_eq!(store.count_active().await.unwrap(), 1);
        assert!(store.find_by_work_order("WO-1").await.is_err());
        assert_eq!(store.history_for("WO-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_of_missing_row_changes_nothing() {
        let (store, _) = store_with(&["WO-1"]).await;
        assert!(matches!(
            store.archive(999, Outcome::Failed, None).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.history(10).await.unwrap().len(), 0);
        assert_eq!(store.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_settle_requires_completion() {
        let (store, mut records) = store_with(&["WO-1"]).await;
        let mut record = records.remove(0);
        assert!(store.settle_and_archive(record.id, None).await.is_err());
        assert_eq!(store.count_active().await.unwrap(), 1);

        record.manufacturing_complete = true;
        store.persist_telemetry(&record).await.unwrap();
        assert_eq!(store.list_pending_settlement().await.unwrap().len(), 1);

        let history = store.settle_and_archive(record.id, None).await.unwrap();
        assert!(history.batch.erp_synced);
        assert_eq!(history.outcome, Outcome::Completed);
        assert_eq!(store.count_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_active_archives_everything() {
        let (store, _) = store_with(&["WO-1", "WO-2", "WO-3"]).await;
        assert_eq!(store.clear_active("operator reset").await.unwrap(), 3);
        assert_eq!(store.count_active().await.unwrap(), 0);
        let history = store.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|h| h.outcome == Outcome::Failed));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_rows() {
        let store = BatchStore::in_memory().await.unwrap();
        for i in 0..5 {
            store
                .record_event(EventLevel::Info, "test", None, &format!("event {i}"), None)
                .await
                .unwrap();
        }
        sqlx::query("UPDATE event_log SET at = 0")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(store.prune_events(30, 2).await.unwrap(), 3);
        let remaining = store.recent_events(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].message, "event 4");
    }

    #[tokio::test]
    async fn test_recent_events_are_kept() {
        let store = BatchStore::in_memory().await.unwrap();
        let details = serde_json::json!({ "fault_code": 42 });
        store
            .record_event(EventLevel::Warn, "plc_fault", Some("WO-1"), "jam", Some(&details))
            .await
            .unwrap();

        assert_eq!(store.prune_events(30, 0).await.unwrap(), 0);
        let events = store.recent_events(1).await.unwrap();
        assert_eq!(events[0].details, Some(details));
        assert_eq!(events[0].level, "warn");
    }

    #[tokio::test]
    async fn test_latest_event_per_work_order() {
        let store = BatchStore::in_memory().await.unwrap();
        assert!(store.latest_event_for("WO-1").await.unwrap().is_none());

        store
            .record_event(EventLevel::Warn, "stale_telemetry", Some("WO-1"), "quiet", None)
            .await
            .unwrap();
        store
            .record_event(EventLevel::Warn, "operation_failed", Some("WO-1"), "failed", None)
            .await
            .unwrap();
        store
            .record_event(EventLevel::Info, "plc_fault", None, "jam", None)
            .await
            .unwrap();

        let latest = store.latest_event_for("WO-1").await.unwrap().unwrap();
        assert_eq!(latest.kind, "operation_failed");
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("gateway.db");
        {
            let store = BatchStore::open(&path).await.unwrap();
            let mut intake = store.begin_intake().await.unwrap();
            intake.stage(&new_batch(1, "WO-9")).await.unwrap();
            intake.commit(1).await.unwrap();
            store.pool().close().await;
        }
        let store = BatchStore::open(&path).await.unwrap();
        assert_eq!(store.find_by_work_order("WO-9").await.unwrap().batch_number, 1);
    }
}
