//! Invoice and payment history queries.

use relaygate_core::db::unix_timestamp;

use super::db::{AdminDatabase, DatabaseError};
use super::models::{PaymentRecord, PendingInvoice};

/// Parameters for persisting a freshly issued invoice.
pub struct InvoiceParams<'a> {
    pub payment_hash: &'a str,
    pub pubkey: &'a str,
    pub npub: &'a str,
    pub tier_id: &'a str,
    pub amount_sats: i64,
    pub payment_request: &'a str,
    pub memo: &'a str,
    pub expires_at: i64,
}

/// Parameters for a payment history row.
pub struct PaymentRecordParams<'a> {
    pub payment_hash: &'a str,
    pub pubkey: &'a str,
    pub tier_id: &'a str,
    pub amount_sats: i64,
    pub paid_at: i64,
}

impl AdminDatabase {
    pub async fn create_invoice(
        &self,
        params: &InvoiceParams<'_>,
    ) -> Result<PendingInvoice, DatabaseError> {
        sqlx::query(
            "INSERT INTO pending_invoices (payment_hash, pubkey, npub, tier_id, amount_sats, payment_request, memo, status, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(params.payment_hash)
        .bind(params.pubkey)
        .bind(params.npub)
        .bind(params.tier_id)
        .bind(params.amount_sats)
        .bind(params.payment_request)
        .bind(params.memo)
        .bind(unix_timestamp())
        .bind(params.expires_at)
        .execute(self.pool())
        .await?;

        self.get_invoice(params.payment_hash)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Invoice {}", params.payment_hash)))
    }

    pub async fn get_invoice(
        &self,
        payment_hash: &str,
    ) -> Result<Option<PendingInvoice>, DatabaseError> {
        let invoice =
            sqlx::query_as::<_, PendingInvoice>("SELECT * FROM pending_invoices WHERE payment_hash = ?")
                .bind(payment_hash)
                .fetch_optional(self.pool())
                .await?;
        Ok(invoice)
    }

    /// Pending invoices that have not yet expired.
    pub async fn list_open_invoices(&self, now: i64) -> Result<Vec<PendingInvoice>, DatabaseError> {
        let invoices = sqlx::query_as::<_, PendingInvoice>(
            "SELECT * FROM pending_invoices WHERE status = 'pending' AND expires_at > ? ORDER BY created_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(invoices)
    }

    /// Mark pending invoices past their expiry as expired.
    pub async fn expire_stale_invoices(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pending_invoices SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Compare-and-swap `pending -> paid`.
    ///
    /// Exactly one caller per payment hash observes `true`. Expired invoices
    /// are also accepted: a settlement that arrives late still counts.
    pub async fn mark_invoice_paid(
        &self,
        payment_hash: &str,
        paid_at: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pending_invoices SET status = 'paid', paid_at = ? WHERE payment_hash = ? AND status IN ('pending', 'expired')",
        )
        .bind(paid_at)
        .bind(payment_hash)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a confirmed payment. Returns `false` if the hash was already recorded.
    pub async fn record_payment(
        &self,
        params: &PaymentRecordParams<'_>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO payment_history (payment_hash, pubkey, tier_id, amount_sats, paid_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(payment_hash) DO NOTHING",
        )
        .bind(params.payment_hash)
        .bind(params.pubkey)
        .bind(params.tier_id)
        .bind(params.amount_sats)
        .bind(params.paid_at)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_payments_for(&self, pubkey: &str) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PaymentRecord>(
            "SELECT * FROM payment_history WHERE pubkey = ? ORDER BY paid_at DESC",
        )
        .bind(pubkey)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }
}
