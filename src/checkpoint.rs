//! Checkpoint Store: durable per-batch progress, the job registry and the
//! advisory job lock.
//!
//! `save` returns only after the record is durable; the batch writer does not
//! move to the next batch before that.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{BatchCheckpoint, CheckpointStatus, EntryError, JobIdentity, TransferJob};

// ============================================================================
// Store Interface
// ============================================================================

pub trait CheckpointStore: Send + Sync {
    /// Registered job for an identity key, if any.
    fn find_job(&self, identity_key: &str) -> Result<Option<TransferJob>>;

    fn register_job(&self, job: &TransferJob) -> Result<()>;

    /// Checkpoints of one job/collection ordered by batch index.
    fn load(&self, job_id: &str, collection_id: &str) -> Result<Vec<BatchCheckpoint>>;

    /// Every checkpoint of a job ordered by collection, then batch index.
    fn load_all(&self, job_id: &str) -> Result<Vec<BatchCheckpoint>>;

    /// Inserts or replaces the record keyed by (job, collection, batch).
    fn save(&self, checkpoint: &BatchCheckpoint) -> Result<()>;

    /// Takes the lock for `key` unless another holder owns a lock younger
    /// than `stale_after`. Returns false when the lock is held.
    fn try_acquire_lock(&self, key: &str, holder: &str, stale_after: Duration) -> Result<bool>;

    fn release_lock(&self, key: &str, holder: &str) -> Result<()>;
}

fn is_stale(acquired_at: DateTime<Utc>, stale_after: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(stale_after) {
        Ok(window) => acquired_at + window < now,
        Err(_) => false,
    }
}

// ============================================================================
// Job Lock
// ============================================================================

/// Held job lock; released on drop.
pub struct JobLock {
    store: Arc<dyn CheckpointStore>,
    key: String,
    holder: String,
}

impl JobLock {
    /// None when another run holds a live lock for the same key.
    pub fn acquire(
        store: Arc<dyn CheckpointStore>,
        key: &str,
        stale_after: Duration,
    ) -> Result<Option<Self>> {
        let holder = uuid::Uuid::new_v4().to_string();
        if !store.try_acquire_lock(key, &holder, stale_after)? {
            return Ok(None);
        }
        debug!(key, holder = %holder, "job lock acquired");
        Ok(Some(Self {
            store,
            key: key.to_string(),
            holder,
        }))
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lock(&self.key, &self.holder) {
            warn!(key = %self.key, "failed to release job lock: {:#}", e);
        }
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    jobs: FxHashMap<String, TransferJob>,
    checkpoints: BTreeMap<(String, String, usize), BatchCheckpoint>,
    locks: FxHashMap<String, (String, DateTime<Utc>)>,
}

/// Process-local store, for embedding and tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<MemoryState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| anyhow!("checkpoint store mutex poisoned"))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn find_job(&self, identity_key: &str) -> Result<Option<TransferJob>> {
        Ok(self.state()?.jobs.get(identity_key).cloned())
    }

    fn register_job(&self, job: &TransferJob) -> Result<()> {
        // First registration wins, like the SQLite INSERT OR IGNORE
        self.state()?
            .jobs
            .entry(job.identity.key())
            .or_insert_with(|| job.clone());
        Ok(())
    }

    fn load(&self, job_id: &str, collection_id: &str) -> Result<Vec<BatchCheckpoint>> {
        Ok(self
            .state()?
            .checkpoints
            .values()
            .filter(|c| c.job_id == job_id && c.collection_id == collection_id)
            .cloned()
            .collect())
    }

    fn load_all(&self, job_id: &str) -> Result<Vec<BatchCheckpoint>> {
        Ok(self
            .state()?
            .checkpoints
            .values()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect())
    }

    fn save(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        let key = (
            checkpoint.job_id.clone(),
            checkpoint.collection_id.clone(),
            checkpoint.batch_index,
        );
        self.state()?.checkpoints.insert(key, checkpoint.clone());
        Ok(())
    }

    fn try_acquire_lock(&self, key: &str, holder: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state()?;
        if let Some((current, acquired_at)) = state.locks.get(key) {
            if current != holder && !is_stale(*acquired_at, stale_after, now) {
                return Ok(false);
            }
            if current != holder {
                warn!(key, previous = %current, "taking over stale job lock");
            }
        }
        state.locks.insert(key.to_string(), (holder.to_string(), now));
        Ok(true)
    }

    fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let mut state = self.state()?;
        if matches!(state.locks.get(key), Some((current, _)) if current == holder) {
            state.locks.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// SQLite Store
// ============================================================================

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        identity_key TEXT PRIMARY KEY,
        job_id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        source_provider_id TEXT NOT NULL,
        target_provider_id TEXT NOT NULL,
        snapshot_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        dry_run INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS checkpoints (
        job_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        batch_index INTEGER NOT NULL,
        status TEXT NOT NULL,
        batch_digest TEXT NOT NULL,
        written_target_ids TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        rejected TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (job_id, collection_id, batch_index)
    );

    CREATE TABLE IF NOT EXISTS job_locks (
        lock_key TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at TEXT NOT NULL
    );
";

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| text_conversion_error(0, e))
}

fn text_conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchCheckpoint> {
    let status: String = row.get(3)?;
    let ids_json: String = row.get(5)?;
    let updated_at: String = row.get(7)?;
    let batch_index: i64 = row.get(2)?;
    let rejected_json: String = row.get(8)?;

    let status = CheckpointStatus::from_db(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown checkpoint status '{}'", status).into(),
        )
    })?;
    let written_target_ids: Vec<String> =
        serde_json::from_str(&ids_json).map_err(|e| text_conversion_error(5, e))?;
    let rejected: Vec<EntryError> =
        serde_json::from_str(&rejected_json).map_err(|e| text_conversion_error(8, e))?;

    Ok(BatchCheckpoint {
        job_id: row.get(0)?,
        collection_id: row.get(1)?,
        batch_index: batch_index as usize,
        status,
        batch_digest: row.get(4)?,
        written_target_ids,
        rejected,
        attempts: row.get(6)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

const CHECKPOINT_COLUMNS: &str = "job_id, collection_id, batch_index, status, batch_digest, \
     written_target_ids, attempts, updated_at, rejected";

/// SQLite-backed checkpoint store (WAL, one serialized connection).
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open checkpoint database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on checkpoint database")?;
        conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA).context("Failed to create checkpoint schema")?;

        let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        let checkpoints: i64 =
            conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
        info!(
            "Checkpoint store ready at {}: {} jobs, {} checkpoints",
            path.display(),
            jobs,
            checkpoints
        );

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("checkpoint database mutex poisoned"))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn find_job(&self, identity_key: &str) -> Result<Option<TransferJob>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT job_id, user_id, source_provider_id, target_provider_id, snapshot_hash,
                    created_at, dry_run
             FROM jobs WHERE identity_key = ?1",
            params![identity_key],
            |row| {
                let created_at: String = row.get(5)?;
                Ok(TransferJob {
                    job_id: row.get(0)?,
                    identity: JobIdentity {
                        user_id: row.get(1)?,
                        source_provider_id: row.get(2)?,
                        target_provider_id: row.get(3)?,
                        snapshot_hash: row.get(4)?,
                    },
                    created_at: parse_timestamp(&created_at)?,
                    dry_run: row.get(6)?,
                })
            },
        )
        .optional()
        .context("Failed to look up job")
    }

    fn register_job(&self, job: &TransferJob) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO jobs
             (identity_key, job_id, user_id, source_provider_id, target_provider_id,
              snapshot_hash, created_at, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.identity.key(),
                job.job_id,
                job.identity.user_id,
                job.identity.source_provider_id,
                job.identity.target_provider_id,
                job.identity.snapshot_hash,
                job.created_at.to_rfc3339(),
                job.dry_run,
            ],
        )
        .context("Failed to register job")?;
        Ok(())
    }

    fn load(&self, job_id: &str, collection_id: &str) -> Result<Vec<BatchCheckpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM checkpoints
             WHERE job_id = ?1 AND collection_id = ?2 ORDER BY batch_index",
            CHECKPOINT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![job_id, collection_id], row_to_checkpoint)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load checkpoints")
    }

    fn load_all(&self, job_id: &str) -> Result<Vec<BatchCheckpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY collection_id, batch_index",
            CHECKPOINT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![job_id], row_to_checkpoint)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load checkpoints")
    }

    fn save(&self, checkpoint: &BatchCheckpoint) -> Result<()> {
        let ids_json = serde_json::to_string(&checkpoint.written_target_ids)?;
        let rejected_json = serde_json::to_string(&checkpoint.rejected)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO checkpoints ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                CHECKPOINT_COLUMNS
            ),
            params![
                checkpoint.job_id,
                checkpoint.collection_id,
                checkpoint.batch_index as i64,
                checkpoint.status.as_db(),
                checkpoint.batch_digest,
                ids_json,
                checkpoint.attempts,
                checkpoint.updated_at.to_rfc3339(),
                rejected_json,
            ],
        )
        .with_context(|| {
            format!(
                "Failed to save checkpoint {}/{}/{}",
                checkpoint.job_id, checkpoint.collection_id, checkpoint.batch_index
            )
        })?;
        Ok(())
    }

    fn try_acquire_lock(&self, key: &str, holder: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, acquired_at FROM job_locks WHERE lock_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((current, acquired_at)) = existing {
            let acquired_at = parse_timestamp(&acquired_at)?;
            if current != holder && !is_stale(acquired_at, stale_after, now) {
                return Ok(false);
            }
            if current != holder {
                warn!(key, previous = %current, "taking over stale job lock");
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO job_locks (lock_key, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![key, holder, now.to_rfc3339()],
        )?;
        tx.commit().context("Failed to commit job lock")?;
        Ok(true)
    }

    fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM job_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key, holder],
        )
        .context("Failed to release job lock")?;
        Ok(())
    }
}
