use async_trait::async_trait;
use nostr::{Event, EventId, PublicKey};
use relaygate_core::db::{days_before, unix_timestamp};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{AdminError, Result};
use crate::events::{EventStore, RetentionException, parse_exceptions};
use crate::storage::{
    AdminDatabase, AuditAction, DeletionRequest, DeletionRequestParams, DeletionStatus,
    RetentionPolicy, SYSTEM_ACTOR,
};
use crate::supervisor::PeriodicJob;

const DELETION_KIND: u16 = 5;

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub requests_processed: usize,
    /// Events removed on behalf of deletion requests.
    pub requested_deleted: u64,
    /// Events removed by the age cutoff.
    pub expired_deleted: u64,
    /// `None` when retention is disabled.
    pub cutoff: Option<i64>,
}

/// Daily content retention plus NIP-09 deletion request handling.
pub struct RetentionEngine {
    db: AdminDatabase,
    events: EventStore,
    operator_pubkey: Option<String>,
}

impl RetentionEngine {
    /// `operator_pubkey` may be hex or npub. When `None`, the whitelist
    /// operator entry is used.
    pub fn new(
        db: AdminDatabase,
        events: EventStore,
        operator_pubkey: Option<&str>,
    ) -> Result<Self> {
        let operator_pubkey = operator_pubkey
            .map(|pk| {
                PublicKey::parse(pk.trim())
                    .map(|pk| pk.to_hex())
                    .map_err(|e| AdminError::Validation(format!("Invalid operator pubkey: {e}")))
            })
            .transpose()?;

        Ok(Self {
            db,
            events,
            operator_pubkey,
        })
    }

    pub async fn policy(&self) -> Result<RetentionPolicy> {
        Ok(self.db.get_retention_policy().await?)
    }

    /// Validate and persist a new policy. `last_run` is kept as stored.
    pub async fn update_policy(&self, policy: &RetentionPolicy) -> Result<RetentionPolicy> {
        if policy.retention_days < 0 {
            return Err(AdminError::Validation(
                "retention_days must not be negative".into(),
            ));
        }
        parse_exceptions(&policy.exceptions).map_err(|e| AdminError::Validation(e.to_string()))?;

        self.db.save_retention_policy(policy).await?;
        self.audit(
            AuditAction::RetentionPolicyUpdated,
            json!({
                "retention_days": policy.retention_days,
                "exceptions": policy.exceptions,
                "honor_nip09": policy.honor_nip09,
            }),
        )
        .await;
        info!(
            retention_days = policy.retention_days,
            exceptions = policy.exceptions.len(),
            honor_nip09 = policy.honor_nip09,
            "Retention policy updated"
        );

        self.policy().await
    }

    /// Queue a signed kind-5 event for processing on the next run.
    ///
    /// Recording the same event again returns the existing request.
    pub async fn record_deletion_request(&self, event: &Event) -> Result<DeletionRequest> {
        if event.kind.as_u16() != DELETION_KIND {
            return Err(AdminError::Validation(format!(
                "Expected a kind {DELETION_KIND} event, got kind {}",
                event.kind.as_u16()
            )));
        }
        event
            .verify()
            .map_err(|e| AdminError::Validation(format!("Invalid deletion event: {e}")))?;

        let event_id = event.id.to_hex();
        let targets = target_ids(event);
        let id = uuid::Uuid::new_v4().to_string();

        let created = self
            .db
            .create_deletion_request(&DeletionRequestParams {
                id: &id,
                event_id: &event_id,
                author_pubkey: &event.pubkey.to_hex(),
                target_event_ids: &targets,
            })
            .await?;
        if created {
            info!(request_id = %id, event_id = %event_id, targets = targets.len(), "Deletion request recorded");
        }

        self.db
            .get_deletion_request_by_event(&event_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("Deletion request for {event_id}")))
    }

    /// One complete retention pass.
    pub async fn run_once(&self) -> Result<RetentionReport> {
        let policy = self.db.get_retention_policy().await?;
        let exceptions = parse_exceptions(&policy.exceptions)
            .map_err(|e| AdminError::Validation(e.to_string()))?;
        let mut report = RetentionReport::default();

        if policy.honor_nip09 {
            self.process_deletion_requests(&mut report).await?;
        }

        let now = unix_timestamp();
        if policy.retention_days > 0 {
            let cutoff = days_before(now, policy.retention_days);
            report.cutoff = Some(cutoff);
            report.expired_deleted = self.delete_expired(cutoff, &exceptions).await?;
        } else {
            debug!("Retention disabled; keeping all events");
        }

        self.db.set_retention_last_run(now).await?;
        self.audit(
            AuditAction::RetentionRun,
            json!({
                "deleted": report.expired_deleted,
                "cutoff": report.cutoff,
                "requests_processed": report.requests_processed,
                "requested_deleted": report.requested_deleted,
            }),
        )
        .await;
        info!(
            deleted = report.expired_deleted,
            cutoff = ?report.cutoff,
            requests = report.requests_processed,
            "Retention run complete"
        );
        Ok(report)
    }

    async fn delete_expired(&self, cutoff: i64, exceptions: &[RetentionException]) -> Result<u64> {
        let operator = match &self.operator_pubkey {
            Some(pk) => Some(pk.clone()),
            None => self.db.operator_pubkey().await?,
        };
        if operator.is_none() {
            warn!("No operator identity known; operator events are not protected");
        }

        let writer = self.events.writer().await;
        let deleted = writer
            .delete_events_before(cutoff, exceptions, operator.as_deref())
            .await?;
        Ok(deleted)
    }

    async fn process_deletion_requests(&self, report: &mut RetentionReport) -> Result<()> {
        for request in self.db.list_pending_deletion_requests().await? {
            let targets = match self.authorized_targets(&request).await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "Author lookup failed; request left pending");
                    continue;
                }
            };

            let result = self.events.writer().await.delete_events_by_ids(&targets).await;
            let (status, deleted) = match result {
                Ok(deleted) => (DeletionStatus::Processed, deleted),
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "Deletion request failed");
                    (DeletionStatus::Failed, 0)
                }
            };

            let deleted_count = i64::try_from(deleted).unwrap_or(i64::MAX);
            self.db
                .complete_deletion_request(&request.id, status, deleted_count)
                .await?;
            self.audit(
                AuditAction::DeletionRequestProcessed,
                json!({
                    "request_id": request.id,
                    "event_id": request.event_id,
                    "status": status,
                    "requested": request.target_event_ids.len(),
                    "deleted": deleted,
                }),
            )
            .await;

            report.requests_processed += 1;
            report.requested_deleted += deleted;
        }
        Ok(())
    }

    /// Targets whose stored author matches the requester. Unknown ids and
    /// foreign events are dropped.
    async fn authorized_targets(&self, request: &DeletionRequest) -> Result<Vec<String>> {
        let mut targets = Vec::with_capacity(request.target_event_ids.len());
        for id in &request.target_event_ids {
            match self.events.get_event_author(id).await? {
                Some(author) if author == request.author_pubkey => targets.push(id.clone()),
                Some(author) => {
                    debug!(
                        request_id = %request.id,
                        event_id = %id,
                        claimed = %request.author_pubkey,
                        actual = %author,
                        "Ignoring deletion of another author's event"
                    );
                }
                None => {}
            }
        }
        Ok(targets)
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

/// Valid event ids named by `e` tags.
fn target_ids(event: &Event) -> Vec<String> {
    let mut ids: Vec<String> = event
        .tags
        .iter()
        .filter_map(|tag| match tag.as_slice() {
            [name, id, ..] if name == "e" => EventId::from_hex(id).ok(),
            _ => None,
        })
        .map(|id| id.to_hex())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[async_trait]
impl PeriodicJob for RetentionEngine {
    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "engine_tests.rs"]
mod tests;
