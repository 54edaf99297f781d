//! Data models for the admin database.

use serde::{Deserialize, Serialize};

/// Lifecycle of a content sync job. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeletionStatus {
    Pending,
    Processed,
    Failed,
}

/// Counters persisted on a sync job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub fetched: i64,
    pub stored: i64,
    pub skipped: i64,
}

impl SyncCounters {
    /// Items that went through verification and insertion.
    pub const fn processed(&self) -> i64 {
        self.stored + self.skipped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncJob {
    pub id: String,
    #[sqlx(json)]
    pub pubkeys: Vec<String>,
    #[sqlx(json)]
    pub relays: Vec<String>,
    #[sqlx(json)]
    pub event_kinds: Vec<u16>,
    pub since_timestamp: Option<i64>,
    pub status: SyncStatus,
    pub events_fetched: i64,
    pub events_stored: i64,
    pub events_skipped: i64,
    pub error_message: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl SyncJob {
    pub const fn counters(&self) -> SyncCounters {
        SyncCounters {
            fetched: self.events_fetched,
            stored: self.events_stored,
            skipped: self.events_skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricingTier {
    pub id: String,
    pub name: String,
    pub amount_sats: i64,
    /// `None` for lifetime tiers.
    pub duration_days: Option<i64>,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WhitelistEntry {
    pub pubkey: String,
    pub npub: String,
    pub nickname: String,
    pub is_operator: bool,
    pub added_by: String,
    pub tier_id: Option<String>,
    pub added_at: i64,
}

/// A paid access grant (`paid_users` row).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Grant {
    pub pubkey: String,
    pub npub: String,
    pub tier_id: String,
    pub amount_sats: i64,
    pub status: GrantStatus,
    /// `None` for lifetime grants.
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingInvoice {
    pub payment_hash: String,
    pub pubkey: String,
    pub npub: String,
    pub tier_id: String,
    pub amount_sats: i64,
    pub payment_request: String,
    pub memo: String,
    pub status: InvoiceStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: i64,
    pub payment_hash: String,
    pub pubkey: String,
    pub tier_id: String,
    pub amount_sats: i64,
    pub paid_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletionRequest {
    pub id: String,
    /// Id of the kind-5 deletion event itself.
    pub event_id: String,
    /// Author claimed by the deletion event.
    pub author_pubkey: String,
    #[sqlx(json)]
    pub target_event_ids: Vec<String>,
    pub status: DeletionStatus,
    pub events_deleted: i64,
    pub received_at: i64,
    pub processed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetentionPolicy {
    /// 0 retains forever.
    pub retention_days: i64,
    #[sqlx(json)]
    pub exceptions: Vec<String>,
    pub honor_nip09: bool,
    pub last_run: Option<i64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 0,
            exceptions: Vec::new(),
            honor_nip09: true,
            last_run: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub details: String,
    pub actor: String,
    pub created_at: i64,
}

/// Audit log actions written by the background engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    SyncStarted,
    SyncFinished,
    InvoiceIssued,
    PaymentConfirmed,
    GrantExpired,
    DeletionRequestProcessed,
    RetentionRun,
    RetentionPolicyUpdated,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncStarted => "sync_started",
            Self::SyncFinished => "sync_finished",
            Self::InvoiceIssued => "invoice_issued",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::GrantExpired => "grant_expired",
            Self::DeletionRequestProcessed => "deletion_request_processed",
            Self::RetentionRun => "retention_run",
            Self::RetentionPolicyUpdated => "retention_policy_updated",
        }
    }
}

/// Actor recorded for changes made by background engines.
pub const SYSTEM_ACTOR: &str = "system";
