//! One-shot, cancellable content sync jobs.

use std::sync::Arc;

use nostr::{Event, PublicKey};
use relaygate_core::config::SyncConfig;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{RelayClient, RelayConnector, SyncFilter};
use crate::error::{AdminError, Result};
use crate::events::EventStore;
use crate::storage::{
    AdminDatabase, AuditAction, NewSyncJob, SYSTEM_ACTOR, SyncCounters, SyncJob, SyncStatus,
};

/// Relay errors kept verbatim in a job's error message.
const MAX_REPORTED_ERRORS: usize = 5;

/// Caller input for [`SyncEngine::start_sync`].
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Authors as hex or npub. Required.
    pub pubkeys: Vec<String>,
    /// Peer relay URLs. Empty uses the configured defaults.
    pub relays: Vec<String>,
    pub kinds: Vec<u16>,
    pub since: Option<i64>,
}

struct ActiveJob {
    id: String,
    token: CancellationToken,
}

struct Inner {
    db: AdminDatabase,
    events: EventStore,
    connector: Arc<dyn RelayConnector>,
    config: SyncConfig,
    active: Mutex<Option<ActiveJob>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Runs at most one sync job per process.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        db: AdminDatabase,
        events: EventStore,
        connector: Arc<dyn RelayConnector>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                events,
                connector,
                config,
                active: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Persist a new job and launch it in the background.
    ///
    /// Returns the job id without waiting for the fetch.
    pub async fn start_sync(&self, request: SyncRequest) -> Result<String> {
        let authors = normalize_authors(&request.pubkeys)?;
        let relays = self.resolve_relays(&request.relays)?;
        if request.since.is_some_and(|since| since < 0) {
            return Err(AdminError::Validation(
                "since must be a non-negative unix timestamp".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().await;
            if let Some(current) = active.as_ref() {
                return Err(AdminError::Conflict(format!(
                    "Sync job {} is already running",
                    current.id
                )));
            }
            *active = Some(ActiveJob {
                id: id.clone(),
                token: token.clone(),
            });
        }

        let author_hex: Vec<String> = authors.iter().map(PublicKey::to_hex).collect();
        let created = self
            .inner
            .db
            .create_sync_job(&NewSyncJob {
                id: &id,
                pubkeys: &author_hex,
                relays: &relays,
                event_kinds: &request.kinds,
                since_timestamp: request.since,
            })
            .await;

        if let Err(e) = created {
            self.inner.release(&id).await;
            return Err(e.into());
        }

        info!(
            job_id = %id,
            authors = authors.len(),
            relays = relays.len(),
            "Sync job started"
        );
        self.inner
            .audit(
                AuditAction::SyncStarted,
                json!({ "job_id": id, "authors": authors.len(), "relays": relays }),
            )
            .await;

        let run = JobRun {
            id: id.clone(),
            authors,
            relays,
            kinds: request.kinds,
            since: request.since,
            token,
            counters: SyncCounters::default(),
            flushed: SyncCounters::default(),
            errors: Vec::new(),
        };
        let inner = Arc::clone(&self.inner);
        let mut slot = self.inner.handle.lock().await;
        *slot = Some(tokio::spawn(async move { inner.run_job(run).await }));

        Ok(id)
    }

    /// Request cancellation of the running job. Returns its id.
    pub async fn cancel_sync(&self) -> Result<String> {
        let active = self.inner.active.lock().await;
        let Some(job) = active.as_ref() else {
            return Err(AdminError::NotFound("No sync job is running".into()));
        };

        job.token.cancel();
        info!(job_id = %job.id, "Sync job cancellation requested");
        Ok(job.id.clone())
    }

    pub async fn current_job_id(&self) -> Option<String> {
        self.inner.active.lock().await.as_ref().map(|j| j.id.clone())
    }

    pub async fn get_job(&self, id: &str) -> Result<SyncJob> {
        Ok(self.inner.db.get_sync_job(id).await?)
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<SyncJob>> {
        Ok(self.inner.db.list_sync_jobs(limit).await?)
    }

    /// Fail jobs a previous process left in `running`.
    ///
    /// Only safe at daemon startup: it cannot tell a stale row from a job
    /// another live process is running against the same database.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let count = self.inner.db.fail_interrupted_sync_jobs().await?;
        if count > 0 {
            warn!(count, "Marked interrupted sync jobs as failed");
        }
        Ok(count)
    }

    /// Wait for the most recently started job task to finish.
    pub async fn wait(&self) {
        let handle = self.inner.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Sync task ended abnormally");
        }
    }

    /// Cancel any running job and wait for it.
    pub async fn shutdown(&self) {
        if self.cancel_sync().await.is_ok() {
            self.wait().await;
        }
    }

    fn resolve_relays(&self, requested: &[String]) -> Result<Vec<String>> {
        let relays: Vec<String> = if requested.is_empty() {
            self.inner.config.default_relays.clone()
        } else {
            requested.iter().map(|r| r.trim().to_string()).collect()
        };

        if relays.is_empty() {
            return Err(AdminError::Validation("No relays to sync from".into()));
        }
        if let Some(bad) = relays
            .iter()
            .find(|r| !(r.starts_with("wss://") || r.starts_with("ws://")))
        {
            return Err(AdminError::Validation(format!(
                "Relay URL must use ws:// or wss://: {bad}"
            )));
        }
        Ok(relays)
    }
}

fn normalize_authors(pubkeys: &[String]) -> Result<Vec<PublicKey>> {
    if pubkeys.is_empty() {
        return Err(AdminError::Validation(
            "At least one author pubkey is required".into(),
        ));
    }

    let mut authors: Vec<PublicKey> = Vec::with_capacity(pubkeys.len());
    for raw in pubkeys {
        let pk = PublicKey::parse(raw.trim())
            .map_err(|e| AdminError::Validation(format!("Invalid pubkey '{raw}': {e}")))?;
        if !authors.contains(&pk) {
            authors.push(pk);
        }
    }
    Ok(authors)
}

/// Mutable state of one running job.
struct JobRun {
    id: String,
    authors: Vec<PublicKey>,
    relays: Vec<String>,
    kinds: Vec<u16>,
    since: Option<i64>,
    token: CancellationToken,
    counters: SyncCounters,
    /// Counters as last persisted.
    flushed: SyncCounters,
    errors: Vec<String>,
}

impl JobRun {
    fn record_error(&mut self, relay: &str, error: impl std::fmt::Display) {
        self.errors.push(format!("{relay}: {error}"));
    }

    fn error_summary(&self) -> String {
        let mut summary = self
            .errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if self.errors.len() > MAX_REPORTED_ERRORS {
            summary.push_str(&format!(
                " (and {} more)",
                self.errors.len() - MAX_REPORTED_ERRORS
            ));
        }
        summary
    }

    fn terminal_status(&self) -> SyncStatus {
        if self.token.is_cancelled() {
            SyncStatus::Cancelled
        } else if self.counters.fetched == 0 && self.counters.stored == 0 && !self.errors.is_empty()
        {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        }
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, mut run: JobRun) {
        let relays = run.relays.clone();
        for url in &relays {
            if run.token.is_cancelled() {
                break;
            }
            self.sync_relay(&mut run, url).await;
        }

        let status = run.terminal_status();
        // Cancelled jobs keep the counters persisted before cancellation.
        let counters = if status == SyncStatus::Cancelled {
            run.flushed
        } else {
            run.counters
        };
        let error_message = run.error_summary();

        match self
            .db
            .finish_sync_job(&run.id, status, &counters, &error_message)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %run.id, "Sync job was no longer running at finish"),
            Err(e) => warn!(job_id = %run.id, error = %e, "Failed to record sync job outcome"),
        }

        info!(
            job_id = %run.id,
            status = status.as_str(),
            fetched = run.counters.fetched,
            stored = run.counters.stored,
            skipped = run.counters.skipped,
            relay_errors = run.errors.len(),
            "Sync job finished"
        );
        self.audit(
            AuditAction::SyncFinished,
            json!({
                "job_id": run.id,
                "status": status.as_str(),
                "fetched": counters.fetched,
                "stored": counters.stored,
                "skipped": counters.skipped,
            }),
        )
        .await;

        self.release(&run.id).await;
    }

    async fn sync_relay(&self, run: &mut JobRun, url: &str) {
        let connected = tokio::select! {
            () = run.token.cancelled() => return,
            result = self.connector.connect(url) => result,
        };
        let mut client = match connected {
            Ok(client) => client,
            Err(e) => {
                warn!(job_id = %run.id, relay = %url, error = %e, "Skipping unreachable relay");
                run.record_error(url, e);
                return;
            }
        };

        let authors = run.authors.clone();
        for author in authors {
            if run.token.is_cancelled() {
                break;
            }
            let filter = SyncFilter {
                author,
                kinds: run.kinds.clone(),
                since: run.since,
            };
            if !self.sync_author(run, client.as_mut(), url, &filter).await {
                break;
            }
        }

        client.close().await;
    }

    /// Drain one author's stored events.
    ///
    /// Returns `false` when the relay must be abandoned: the job was cancelled
    /// or the connection is gone. A refused or closed subscription only costs
    /// this author.
    async fn sync_author(
        &self,
        run: &mut JobRun,
        client: &mut dyn RelayClient,
        url: &str,
        filter: &SyncFilter,
    ) -> bool {
        if let Err(e) = client.subscribe(filter).await {
            warn!(job_id = %run.id, relay = %url, author = %filter.author, error = %e, "Subscription failed");
            let usable = !e.is_connection_lost();
            run.record_error(url, e);
            return usable;
        }

        loop {
            let next = tokio::select! {
                biased;
                () = run.token.cancelled() => return false,
                next = client.next_event() => next,
            };

            match next {
                Ok(Some(event)) => self.process_event(run, &event).await,
                Ok(None) => return true,
                Err(e) => {
                    warn!(job_id = %run.id, relay = %url, author = %filter.author, error = %e, "Relay stream failed");
                    let usable = !e.is_connection_lost();
                    run.record_error(url, e);
                    return usable;
                }
            }
        }
    }

    async fn process_event(&self, run: &mut JobRun, event: &Event) {
        run.counters.fetched += 1;

        if event.verify().is_err() {
            debug!(job_id = %run.id, event_id = %event.id, "Invalid signature, skipping");
            run.counters.skipped += 1;
        } else {
            match self.events.writer().await.insert_event(event).await {
                Ok(true) => run.counters.stored += 1,
                Ok(false) => run.counters.skipped += 1,
                Err(e) => {
                    warn!(job_id = %run.id, event_id = %event.id, error = %e, "Failed to store event");
                    run.counters.skipped += 1;
                }
            }
        }

        let pending = run.counters.processed() - run.flushed.processed();
        if u64::try_from(pending).unwrap_or(0) >= self.config.progress_flush_every {
            self.flush(run).await;
        }
    }

    async fn flush(&self, run: &mut JobRun) {
        if run.token.is_cancelled() {
            return;
        }
        match self.db.update_sync_progress(&run.id, &run.counters).await {
            Ok(_) => run.flushed = run.counters,
            Err(e) => warn!(job_id = %run.id, error = %e, "Failed to flush sync progress"),
        }
    }

    async fn release(&self, id: &str) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|job| job.id == id) {
            *active = None;
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
#[path = "engine_tests.rs"]
mod tests;
