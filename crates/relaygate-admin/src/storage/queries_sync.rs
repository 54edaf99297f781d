//! Sync job queries.

use relaygate_core::db::unix_timestamp;
use sqlx::types::Json;

use super::db::{AdminDatabase, DatabaseError};
use super::models::{SyncCounters, SyncJob, SyncStatus};

/// Parameters for creating a sync job row.
pub struct NewSyncJob<'a> {
    pub id: &'a str,
    pub pubkeys: &'a [String],
    pub relays: &'a [String],
    pub event_kinds: &'a [u16],
    pub since_timestamp: Option<i64>,
}

impl AdminDatabase {
    /// Insert a job in `running` state.
    ///
    /// Returns `DatabaseError::Conflict` if another job is already running;
    /// the partial unique index on `status = 'running'` enforces this across
    /// processes sharing the database.
    pub async fn create_sync_job(&self, job: &NewSyncJob<'_>) -> Result<SyncJob, DatabaseError> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, pubkeys, relays, event_kinds, since_timestamp, status, started_at) VALUES (?, ?, ?, ?, ?, 'running', ?)",
        )
        .bind(job.id)
        .bind(Json(job.pubkeys))
        .bind(Json(job.relays))
        .bind(Json(job.event_kinds))
        .bind(job.since_timestamp)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_sync_job(job.id).await
    }

    pub async fn get_sync_job(&self, id: &str) -> Result<SyncJob, DatabaseError> {
        sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Sync job {id}")))
    }

    /// The currently running job, if any.
    pub async fn running_sync_job(&self) -> Result<Option<SyncJob>, DatabaseError> {
        let job = sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE status = 'running'")
            .fetch_optional(self.pool())
            .await?;
        Ok(job)
    }

    /// Most recent jobs first.
    pub async fn list_sync_jobs(&self, limit: i64) -> Result<Vec<SyncJob>, DatabaseError> {
        let jobs = sqlx::query_as::<_, SyncJob>(
            "SELECT * FROM sync_jobs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    /// Flush progress counters. No-op once the job left `running`.
    pub async fn update_sync_progress(
        &self,
        id: &str,
        counters: &SyncCounters,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET events_fetched = ?, events_stored = ?, events_skipped = ? WHERE id = ? AND status = 'running'",
        )
        .bind(counters.fetched)
        .bind(counters.stored)
        .bind(counters.skipped)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a running job to a terminal state with its final counters.
    pub async fn finish_sync_job(
        &self,
        id: &str,
        status: SyncStatus,
        counters: &SyncCounters,
        error_message: &str,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "Cannot finish sync job {id} with non-terminal status {}",
                status.as_str()
            )));
        }

        let result = sqlx::query(
            "UPDATE sync_jobs SET status = ?, events_fetched = ?, events_stored = ?, events_skipped = ?, error_message = ?, completed_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status)
        .bind(counters.fetched)
        .bind(counters.stored)
        .bind(counters.skipped)
        .bind(error_message)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fail jobs left `running` by a process that died mid-sync.
    pub async fn fail_interrupted_sync_jobs(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', error_message = 'interrupted by restart', completed_at = ? WHERE status = 'running'",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_sync_jobs(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_jobs")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
