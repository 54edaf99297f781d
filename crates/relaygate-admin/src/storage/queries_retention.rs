//! Retention policy and deletion request queries.

use relaygate_core::db::unix_timestamp;
use sqlx::types::Json;

use super::db::{AdminDatabase, DatabaseError};
use super::models::{DeletionRequest, DeletionStatus, RetentionPolicy};

/// Parameters for recording a NIP-09 deletion request.
pub struct DeletionRequestParams<'a> {
    pub id: &'a str,
    pub event_id: &'a str,
    pub author_pubkey: &'a str,
    pub target_event_ids: &'a [String],
}

impl AdminDatabase {
    // =========================================================================
    // Retention policy (single row)
    // =========================================================================

    pub async fn get_retention_policy(&self) -> Result<RetentionPolicy, DatabaseError> {
        let policy = sqlx::query_as::<_, RetentionPolicy>(
            "SELECT retention_days, exceptions, honor_nip09, last_run FROM retention_policy WHERE id = 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(policy.unwrap_or_default())
    }

    /// Persist days, exceptions and the NIP-09 flag. `last_run` is untouched.
    pub async fn save_retention_policy(&self, policy: &RetentionPolicy) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO retention_policy (id, retention_days, exceptions, honor_nip09) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET retention_days = excluded.retention_days,
                exceptions = excluded.exceptions, honor_nip09 = excluded.honor_nip09",
        )
        .bind(policy.retention_days)
        .bind(Json(&policy.exceptions))
        .bind(policy.honor_nip09)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_retention_last_run(&self, at: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE retention_policy SET last_run = ? WHERE id = 1")
            .bind(at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Deletion requests
    // =========================================================================

    /// Store a pending request. Returns `false` if the deletion event was
    /// already recorded.
    pub async fn create_deletion_request(
        &self,
        params: &DeletionRequestParams<'_>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO deletion_requests (id, event_id, author_pubkey, target_event_ids, status, received_at) VALUES (?, ?, ?, ?, 'pending', ?)
             ON CONFLICT(event_id) DO NOTHING",
        )
        .bind(params.id)
        .bind(params.event_id)
        .bind(params.author_pubkey)
        .bind(Json(params.target_event_ids))
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_deletion_request(&self, id: &str) -> Result<DeletionRequest, DatabaseError> {
        sqlx::query_as::<_, DeletionRequest>("SELECT * FROM deletion_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Deletion request {id}")))
    }

    pub async fn get_deletion_request_by_event(
        &self,
        event_id: &str,
    ) -> Result<Option<DeletionRequest>, DatabaseError> {
        let request =
            sqlx::query_as::<_, DeletionRequest>("SELECT * FROM deletion_requests WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(request)
    }

    /// Oldest first.
    pub async fn list_pending_deletion_requests(
        &self,
    ) -> Result<Vec<DeletionRequest>, DatabaseError> {
        let requests = sqlx::query_as::<_, DeletionRequest>(
            "SELECT * FROM deletion_requests WHERE status = 'pending' ORDER BY received_at, rowid",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(requests)
    }

    /// Close a pending request with its outcome.
    pub async fn complete_deletion_request(
        &self,
        id: &str,
        status: DeletionStatus,
        events_deleted: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE deletion_requests SET status = ?, events_deleted = ?, processed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status)
        .bind(events_deleted)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
