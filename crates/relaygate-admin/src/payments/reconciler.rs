//! Invoice issuing and settlement reconciliation.
//!
//! Settlements arrive from two independent paths: a periodic poll of open
//! invoices and a push subscription to the backend. Both funnel into
//! [`PaymentReconciler::process_payment`], which is idempotent per payment
//! hash: only the caller that flips the invoice to `paid` records history,
//! writes the audit entry and propagates access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{PublicKey, ToBech32};
use relaygate_core::config::PaymentsConfig;
use relaygate_core::db::{SECS_PER_DAY, unix_timestamp};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backend::PaymentBackend;
use crate::access::AccessSync;
use crate::error::{AdminError, Result};
use crate::storage::{
    AdminDatabase, AuditAction, GrantParams, InvoiceParams, InvoiceStatus, PaymentRecordParams,
    PendingInvoice, SYSTEM_ACTOR, WhitelistParams,
};
use crate::supervisor::{PeriodicJob, PeriodicTask, Schedule, StopSignal, Supervisor};

const SETTLEMENT_BUFFER: usize = 64;

/// Result of handling one settlement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// No invoice with this payment hash; the notification was ignored.
    Unknown,
    /// Another path already settled the invoice.
    AlreadyPaid,
    /// This call settled the invoice. `expires_at` is `None` for lifetime access.
    Settled { expires_at: Option<i64> },
}

struct Inner {
    db: AdminDatabase,
    backend: Arc<dyn PaymentBackend>,
    access: Arc<AccessSync>,
    config: PaymentsConfig,
}

/// Issues invoices and turns settlements into access grants.
pub struct PaymentReconciler {
    inner: Arc<Inner>,
    poll: PeriodicTask,
    subscription: Supervisor,
}

impl PaymentReconciler {
    pub fn new(
        db: AdminDatabase,
        backend: Arc<dyn PaymentBackend>,
        access: Arc<AccessSync>,
        config: PaymentsConfig,
    ) -> Self {
        let interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let inner = Arc::new(Inner {
            db,
            backend,
            access,
            config,
        });
        let poll = PeriodicTask::new(
            "payment-poll",
            Schedule::Every(interval),
            Arc::clone(&inner) as Arc<dyn PeriodicJob>,
        );

        Self {
            inner,
            poll,
            subscription: Supervisor::new("payment-subscription"),
        }
    }

    /// Start the poll loop and the settlement subscription. Idempotent.
    pub async fn start(&self) {
        self.poll.start().await;

        let inner = Arc::clone(&self.inner);
        self.subscription
            .start(move |stop| run_subscription(inner, stop))
            .await;
    }

    pub async fn stop(&self) {
        self.poll.stop().await;
        self.subscription.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.poll.is_running().await || self.subscription.is_running().await
    }

    /// Create a backend invoice for `tier_id` and persist it as pending.
    pub async fn issue_invoice(&self, pubkey: &str, tier_id: &str) -> Result<PendingInvoice> {
        self.inner.issue_invoice(pubkey, tier_id).await
    }

    /// Apply a settlement for `payment_hash`. Safe to call any number of
    /// times, concurrently, from any path.
    pub async fn process_payment(&self, payment_hash: &str) -> Result<SettlementOutcome> {
        self.inner.process_payment(payment_hash).await
    }

    /// One poll pass over open invoices.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.poll_once().await
    }
}

impl Inner {
    async fn issue_invoice(&self, pubkey: &str, tier_id: &str) -> Result<PendingInvoice> {
        let pk = PublicKey::parse(pubkey.trim())
            .map_err(|e| AdminError::Validation(format!("Invalid pubkey {pubkey}: {e}")))?;
        let hex = pk.to_hex();
        let npub = pk
            .to_bech32()
            .map_err(|e| AdminError::Validation(format!("Cannot encode npub: {e}")))?;

        let tier = self.db.get_tier(tier_id).await?;
        if !tier.active {
            return Err(AdminError::NotFound(format!(
                "Pricing tier {tier_id} is not active"
            )));
        }

        let memo = format!("Relay access: {}", tier.name);
        let created = self
            .backend
            .create_invoice(tier.amount_sats, &memo, self.config.invoice_expiry_secs)
            .await?;

        let invoice = self
            .db
            .create_invoice(&InvoiceParams {
                payment_hash: &created.payment_hash,
                pubkey: &hex,
                npub: &npub,
                tier_id: &tier.id,
                amount_sats: tier.amount_sats,
                payment_request: &created.payment_request,
                memo: &memo,
                expires_at: unix_timestamp() + self.config.invoice_expiry_secs,
            })
            .await?;

        self.audit(
            AuditAction::InvoiceIssued,
            json!({
                "payment_hash": invoice.payment_hash,
                "pubkey": invoice.pubkey,
                "tier_id": invoice.tier_id,
                "amount_sats": invoice.amount_sats,
            }),
        )
        .await;
        info!(
            payment_hash = %invoice.payment_hash,
            pubkey = %invoice.pubkey,
            tier_id = %invoice.tier_id,
            "Invoice issued"
        );
        Ok(invoice)
    }

    async fn process_payment(&self, payment_hash: &str) -> Result<SettlementOutcome> {
        let Some(invoice) = self.db.get_invoice(payment_hash).await? else {
            debug!(payment_hash, "Settlement for unknown invoice ignored");
            return Ok(SettlementOutcome::Unknown);
        };
        if invoice.status == InvoiceStatus::Paid {
            return Ok(SettlementOutcome::AlreadyPaid);
        }

        let tier = self.db.get_tier(&invoice.tier_id).await?;
        let now = unix_timestamp();
        let expires_at = tier.duration_days.map(|days| now + days * SECS_PER_DAY);

        if let Err(e) = self
            .db
            .upsert_whitelist_entry(&WhitelistParams {
                pubkey: &invoice.pubkey,
                npub: &invoice.npub,
                nickname: "",
                is_operator: false,
                added_by: SYSTEM_ACTOR,
                tier_id: Some(&tier.id),
            })
            .await
        {
            error!(payment_hash, error = %e, "Failed to whitelist paying pubkey");
        }

        if let Err(e) = self
            .db
            .upsert_grant(&GrantParams {
                pubkey: &invoice.pubkey,
                npub: &invoice.npub,
                tier_id: &tier.id,
                amount_sats: invoice.amount_sats,
                expires_at,
            })
            .await
        {
            error!(payment_hash, error = %e, "Failed to record access grant");
        }

        if !self.db.mark_invoice_paid(payment_hash, now).await? {
            debug!(payment_hash, "Invoice settled concurrently");
            return Ok(SettlementOutcome::AlreadyPaid);
        }

        if let Err(e) = self
            .db
            .record_payment(&PaymentRecordParams {
                payment_hash,
                pubkey: &invoice.pubkey,
                tier_id: &tier.id,
                amount_sats: invoice.amount_sats,
                paid_at: now,
            })
            .await
        {
            error!(payment_hash, error = %e, "Failed to record payment history");
        }
        self.audit(
            AuditAction::PaymentConfirmed,
            json!({
                "payment_hash": payment_hash,
                "pubkey": invoice.pubkey,
                "tier_id": tier.id,
                "amount_sats": invoice.amount_sats,
                "expires_at": expires_at,
            }),
        )
        .await;

        self.access.sync_best_effort().await;

        info!(
            payment_hash,
            pubkey = %invoice.pubkey,
            tier_id = %tier.id,
            expires_at = ?expires_at,
            "Payment confirmed"
        );
        Ok(SettlementOutcome::Settled { expires_at })
    }

    async fn poll_once(&self) -> Result<usize> {
        let now = unix_timestamp();
        let expired = self.db.expire_stale_invoices(now).await?;
        if expired > 0 {
            debug!(expired, "Stale invoices expired");
        }

        let mut settled = 0;
        for invoice in self.db.list_open_invoices(now).await? {
            match self.backend.check_invoice(&invoice.payment_hash).await {
                Ok(true) => match self.process_payment(&invoice.payment_hash).await {
                    Ok(SettlementOutcome::Settled { .. }) => settled += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(payment_hash = %invoice.payment_hash, error = %e, "Failed to settle paid invoice");
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    warn!(payment_hash = %invoice.payment_hash, error = %e, "Invoice status check failed");
                }
            }
        }
        Ok(settled)
    }

    async fn handle_settlement(&self, payment_hash: &str) {
        if let Err(e) = self.process_payment(payment_hash).await {
            error!(payment_hash, error = %e, "Failed to process pushed settlement");
        }
    }

    async fn audit(&self, action: AuditAction, details: serde_json::Value) {
        if let Err(e) = self
            .db
            .add_audit_log(action, &details.to_string(), SYSTEM_ACTOR)
            .await
        {
            warn!(action = action.as_str(), error = %e, "Failed to write audit log");
        }
    }
}

#[async_trait]
impl PeriodicJob for Inner {
    async fn run(&self) -> Result<()> {
        self.poll_once().await.map(|_| ())
    }
}

/// Keep a settlement subscription open, re-subscribing after a delay
/// whenever the stream ends.
async fn run_subscription(inner: Arc<Inner>, mut stop: StopSignal) {
    let delay = Duration::from_secs(inner.config.resubscribe_delay_secs);

    loop {
        let (tx, mut rx) = mpsc::channel::<String>(SETTLEMENT_BUFFER);
        let backend = Arc::clone(&inner.backend);
        let stream = backend.subscribe_settlements(tx);
        tokio::pin!(stream);
        let mut stream_done = false;

        loop {
            tokio::select! {
                () = stop.stopped() => return,
                result = &mut stream, if !stream_done => {
                    stream_done = true;
                    match result {
                        Ok(()) => info!("Settlement stream closed"),
                        Err(e) => warn!(error = %e, "Settlement stream failed"),
                    }
                }
                hash = rx.recv() => match hash {
                    Some(hash) => inner.handle_settlement(&hash).await,
                    None => break,
                },
            }
        }

        debug!(delay_secs = delay.as_secs(), "Re-subscribing to settlements");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = stop.stopped() => return,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
#[path = "reconciler_tests.rs"]
mod tests;
