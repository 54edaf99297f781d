//! End-to-end payment flow: invoice, poll settlement, pushed re-delivery.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr::Keys;
use relaygate_admin::access::{AccessSync, DetachedRelay, PolicyFile};
use relaygate_admin::payments::{
    CreatedInvoice, PaymentBackend, PaymentError, PaymentReconciler, SettlementOutcome,
};
use relaygate_admin::storage::{AdminDatabase, AuditAction, InvoiceStatus, TierParams};
use relaygate_core::config::PaymentsConfig;
use relaygate_core::db::{SECS_PER_DAY, unix_timestamp};
use tokio::sync::mpsc;

#[derive(Default)]
struct ScriptedBackend {
    next: AtomicU64,
    settled: Mutex<HashSet<String>>,
    deliver: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentBackend for ScriptedBackend {
    async fn create_invoice(
        &self,
        amount_sats: i64,
        _memo: &str,
        _expiry_secs: i64,
    ) -> Result<CreatedInvoice, PaymentError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedInvoice {
            payment_hash: format!("{n:064x}"),
            payment_request: format!("lnbc{amount_sats}n1e2e{n}"),
        })
    }

    async fn check_invoice(&self, payment_hash: &str) -> Result<bool, PaymentError> {
        Ok(self.settled.lock().unwrap().contains(payment_hash))
    }

    async fn subscribe_settlements(&self, settled: mpsc::Sender<String>) -> Result<(), PaymentError> {
        let pending: Vec<String> = self.deliver.lock().unwrap().drain(..).collect();
        for hash in pending {
            let _ = settled.send(hash).await;
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn monthly_tier_settles_once_across_both_paths() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("whitelist.json");

    let db = AdminDatabase::open_in_memory().await.unwrap();
    db.upsert_tier(&TierParams {
        id: "monthly",
        name: "Monthly",
        amount_sats: 10_000,
        duration_days: Some(30),
        active: true,
    })
    .await
    .unwrap();

    let backend = Arc::new(ScriptedBackend::default());
    let access = Arc::new(AccessSync::new(
        db.clone(),
        Arc::new(DetachedRelay),
        Some(policy_path.clone()),
    ));
    let reconciler = PaymentReconciler::new(
        db.clone(),
        Arc::clone(&backend) as Arc<dyn PaymentBackend>,
        access,
        PaymentsConfig {
            enabled: true,
            poll_interval_secs: 3600,
            resubscribe_delay_secs: 1,
            ..PaymentsConfig::default()
        },
    );

    let payer = Keys::generate().public_key().to_hex();
    let invoice = reconciler.issue_invoice(&payer, "monthly").await.unwrap();
    assert_eq!(invoice.amount_sats, 10_000);

    // Poll path.
    backend
        .settled
        .lock()
        .unwrap()
        .insert(invoice.payment_hash.clone());
    assert_eq!(reconciler.poll_once().await.unwrap(), 1);

    let grant = db.get_grant(&payer).await.unwrap().unwrap();
    let expires_at = grant.expires_at.unwrap();
    let expected = unix_timestamp() + 30 * SECS_PER_DAY;
    assert!((expected - expires_at).abs() <= 5);

    let whitelist: Vec<String> = db
        .list_whitelist()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.pubkey)
        .collect();
    assert!(whitelist.contains(&payer));

    let policy: PolicyFile =
        serde_json::from_slice(&std::fs::read(&policy_path).unwrap()).unwrap();
    assert!(policy.pubkeys.contains(&payer));

    // Subscription path re-delivers the same settlement.
    backend
        .deliver
        .lock()
        .unwrap()
        .push(invoice.payment_hash.clone());
    reconciler.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    reconciler.stop().await;

    assert_eq!(
        reconciler
            .process_payment(&invoice.payment_hash)
            .await
            .unwrap(),
        SettlementOutcome::AlreadyPaid
    );
    assert_eq!(
        db.count_audit_entries(AuditAction::PaymentConfirmed)
            .await
            .unwrap(),
        1
    );
    assert_eq!(db.list_payments_for(&payer).await.unwrap().len(), 1);
    let stored = db.get_invoice(&invoice.payment_hash).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}
