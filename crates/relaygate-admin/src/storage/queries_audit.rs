//! Audit log queries.

use relaygate_core::db::unix_timestamp;

use super::db::{AdminDatabase, DatabaseError};
use super::models::{AuditAction, AuditLogEntry};

impl AdminDatabase {
    pub async fn add_audit_log(
        &self,
        action: AuditAction,
        details: &str,
        actor: &str,
    ) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO audit_log (action, details, actor, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(action.as_str())
        .bind(details)
        .bind(actor)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest first, optionally filtered by action.
    pub async fn list_audit_log(
        &self,
        action: Option<AuditAction>,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let entries = match action {
            Some(action) => {
                sqlx::query_as::<_, AuditLogEntry>(
                    "SELECT * FROM audit_log WHERE action = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(action.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, AuditLogEntry>("SELECT * FROM audit_log ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(entries)
    }

    pub async fn count_audit_entries(&self, action: AuditAction) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE action = ?")
            .bind(action.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
