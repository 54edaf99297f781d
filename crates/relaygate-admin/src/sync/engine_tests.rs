//! Tests for the content sync engine, driven through fake peer relays.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{EventBuilder, Keys, Kind, ToBech32};
use relaygate_core::config::SyncConfig;

use super::*;
use crate::sync::client::RelayError;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Clone, Default)]
struct FakeRelay {
    by_author: HashMap<String, Vec<Event>>,
    unreachable: bool,
    /// Block after the stored events instead of sending EOSE.
    hang: bool,
    /// Authors whose subscription the relay answers with CLOSED.
    refused: HashSet<String>,
    /// Authors whose subscription drops the socket.
    drops_on: HashSet<String>,
}

impl FakeRelay {
    fn with_events(events: &[Event]) -> Self {
        let mut relay = Self::default();
        for ev in events {
            relay
                .by_author
                .entry(ev.pubkey.to_hex())
                .or_default()
                .push(ev.clone());
        }
        relay
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn refusing(mut self, keys: &Keys) -> Self {
        self.refused.insert(keys.public_key().to_hex());
        self
    }

    fn dropping_on(mut self, keys: &Keys) -> Self {
        self.drops_on.insert(keys.public_key().to_hex());
        self
    }

    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct FakeConnector {
    relays: HashMap<String, FakeRelay>,
}

impl FakeConnector {
    fn with(mut self, url: &str, relay: FakeRelay) -> Self {
        self.relays.insert(url.to_string(), relay);
        self
    }
}

#[async_trait]
impl RelayConnector for FakeConnector {
    async fn connect(&self, url: &str) -> std::result::Result<Box<dyn RelayClient>, RelayError> {
        match self.relays.get(url) {
            Some(relay) if !relay.unreachable => Ok(Box::new(FakeClient {
                relay: relay.clone(),
                queue: VecDeque::new(),
                failure: None,
                dead: false,
            })),
            _ => Err(RelayError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }
}

struct FakeClient {
    relay: FakeRelay,
    queue: VecDeque<Event>,
    failure: Option<RelayError>,
    dead: bool,
}

#[async_trait]
impl RelayClient for FakeClient {
    async fn subscribe(&mut self, filter: &SyncFilter) -> std::result::Result<(), RelayError> {
        if self.dead {
            return Err(RelayError::Disconnected("socket gone".into()));
        }
        let author = filter.author.to_hex();
        if self.relay.refused.contains(&author) {
            self.queue.clear();
            self.failure = Some(RelayError::Closed("restricted: this author".into()));
            return Ok(());
        }
        if self.relay.drops_on.contains(&author) {
            self.queue.clear();
            self.dead = true;
            self.failure = Some(RelayError::Disconnected("reset by peer".into()));
            return Ok(());
        }
        self.queue = self
            .relay
            .by_author
            .get(&filter.author.to_hex())
            .cloned()
            .unwrap_or_default()
            .into();
        Ok(())
    }

    async fn next_event(&mut self) -> std::result::Result<Option<Event>, RelayError> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        if let Some(ev) = self.queue.pop_front() {
            return Ok(Some(ev));
        }
        if self.relay.hang {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn close(&mut self) {}
}

// =============================================================================
// Helpers
// =============================================================================

const RELAY_A: &str = "wss://a.example";
const RELAY_B: &str = "wss://b.example";

fn note(keys: &Keys, content: &str) -> Event {
    EventBuilder::new(Kind::TextNote, content)
        .sign_with_keys(keys)
        .unwrap()
}

fn tampered(event: &Event) -> Event {
    let mut bad = event.clone();
    bad.content = "tampered".to_string();
    bad
}

fn sync_config(flush_every: u64) -> SyncConfig {
    SyncConfig {
        default_relays: vec![RELAY_A.to_string()],
        progress_flush_every: flush_every,
        connect_timeout_secs: 1,
    }
}

async fn engine_with(connector: FakeConnector, flush_every: u64) -> (SyncEngine, EventStore) {
    let db = AdminDatabase::open_in_memory().await.unwrap();
    let events = EventStore::open_in_memory().await.unwrap();
    let engine = SyncEngine::new(
        db,
        events.clone(),
        Arc::new(connector),
        sync_config(flush_every),
    );
    (engine, events)
}

fn request(keys: &[&Keys], relays: &[&str]) -> SyncRequest {
    SyncRequest {
        pubkeys: keys.iter().map(|k| k.public_key().to_hex()).collect(),
        relays: relays.iter().map(ToString::to_string).collect(),
        kinds: vec![1],
        since: None,
    }
}

async fn run_to_end(engine: &SyncEngine, req: SyncRequest) -> SyncJob {
    let id = engine.start_sync(req).await.unwrap();
    engine.wait().await;
    engine.get_job(&id).await.unwrap()
}

async fn wait_for_fetched(engine: &SyncEngine, id: &str, at_least: i64) {
    for _ in 0..200 {
        if engine.get_job(id).await.unwrap().events_fetched >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {at_least} fetched events");
}

// =============================================================================
// Fetch and verification
// =============================================================================

#[tokio::test]
async fn stores_verified_events_and_skips_duplicates() {
    let alice = Keys::generate();
    let e1 = note(&alice, "one");
    let e2 = note(&alice, "two");
    let connector = FakeConnector::default()
        .with(RELAY_A, FakeRelay::with_events(&[e1.clone(), e2]))
        .with(RELAY_B, FakeRelay::with_events(&[e1]));
    let (engine, events) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice], &[RELAY_A, RELAY_B])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_fetched, 3);
    assert_eq!(job.events_stored, 2);
    assert_eq!(job.events_skipped, 1);
    assert!(job.error_message.is_empty());
    assert_eq!(events.count_events().await.unwrap(), 2);
    assert!(engine.current_job_id().await.is_none());
}

#[tokio::test]
async fn invalid_signatures_are_skipped_not_stored() {
    let alice = Keys::generate();
    let good = note(&alice, "good");
    let bad = tampered(&note(&alice, "bad"));
    let connector =
        FakeConnector::default().with(RELAY_A, FakeRelay::with_events(&[bad.clone(), good]));
    let (engine, events) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice], &[RELAY_A])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_fetched, 2);
    assert_eq!(job.events_stored, 1);
    assert_eq!(job.events_skipped, 1);
    assert!(!events.event_exists(&bad.id.to_hex()).await.unwrap());
}

#[tokio::test]
async fn authors_visited_on_every_relay() {
    let alice = Keys::generate();
    let bob = Keys::generate();
    let connector = FakeConnector::default()
        .with(RELAY_A, FakeRelay::with_events(&[note(&alice, "a1")]))
        .with(RELAY_B, FakeRelay::with_events(&[note(&bob, "b1")]));
    let (engine, events) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice, &bob], &[RELAY_A, RELAY_B])).await;

    assert_eq!(job.events_stored, 2);
    assert_eq!(events.count_events().await.unwrap(), 2);
}

// =============================================================================
// Relay failures and terminal status
// =============================================================================

#[tokio::test]
async fn unreachable_relay_is_skipped() {
    let alice = Keys::generate();
    let connector = FakeConnector::default()
        .with(RELAY_A, FakeRelay::unreachable())
        .with(RELAY_B, FakeRelay::with_events(&[note(&alice, "hi")]));
    let (engine, _) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice], &[RELAY_A, RELAY_B])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_stored, 1);
    assert!(job.error_message.contains(RELAY_A));
}

#[tokio::test]
async fn closed_subscription_only_skips_that_author() {
    let alice = Keys::generate();
    let bob = Keys::generate();
    let from_bob = note(&bob, "still here");
    let connector = FakeConnector::default().with(
        RELAY_A,
        FakeRelay::with_events(&[note(&alice, "hidden"), from_bob.clone()]).refusing(&alice),
    );
    let (engine, events) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice, &bob], &[RELAY_A])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_fetched, 1);
    assert_eq!(job.events_stored, 1);
    assert!(job.error_message.contains("restricted: this author"));
    assert!(events.event_exists(&from_bob.id.to_hex()).await.unwrap());
}

#[tokio::test]
async fn lost_connection_abandons_remaining_authors_on_relay() {
    let alice = Keys::generate();
    let bob = Keys::generate();
    let connector = FakeConnector::default()
        .with(
            RELAY_A,
            FakeRelay::with_events(&[note(&bob, "unreached")]).dropping_on(&alice),
        )
        .with(RELAY_B, FakeRelay::with_events(&[note(&bob, "elsewhere")]));
    let (engine, _) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice, &bob], &[RELAY_A, RELAY_B])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_fetched, 1);
    assert!(job.error_message.contains("reset by peer"));
    assert!(!job.error_message.contains("socket gone"));
}

#[tokio::test]
async fn nothing_fetched_with_connection_errors_fails() {
    let alice = Keys::generate();
    let connector = FakeConnector::default().with(RELAY_A, FakeRelay::unreachable());
    let (engine, _) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice], &[RELAY_A, RELAY_B])).await;

    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job.error_message.contains(RELAY_A));
    assert!(job.error_message.contains(RELAY_B));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn nothing_fetched_without_errors_completes() {
    let alice = Keys::generate();
    let connector = FakeConnector::default().with(RELAY_A, FakeRelay::default());
    let (engine, _) = engine_with(connector, 100).await;

    let job = run_to_end(&engine, request(&[&alice], &[RELAY_A])).await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_fetched, 0);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn missing_authors_rejected_without_job_row() {
    let (engine, _) = engine_with(FakeConnector::default(), 100).await;

    let err = engine
        .start_sync(SyncRequest::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AdminError::Validation(_)));
    assert!(engine.list_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_pubkey_and_relay_scheme_rejected() {
    let (engine, _) = engine_with(FakeConnector::default(), 100).await;

    let bad_key = SyncRequest {
        pubkeys: vec!["not-a-key".into()],
        ..SyncRequest::default()
    };
    assert!(matches!(
        engine.start_sync(bad_key).await,
        Err(AdminError::Validation(_))
    ));

    let bad_relay = request(&[&Keys::generate()], &["https://relay.example"]);
    assert!(matches!(
        engine.start_sync(bad_relay).await,
        Err(AdminError::Validation(_))
    ));
    assert!(engine.current_job_id().await.is_none());
}

#[tokio::test]
async fn npub_authors_normalized_and_default_relays_used() {
    let alice = Keys::generate();
    let connector =
        FakeConnector::default().with(RELAY_A, FakeRelay::with_events(&[note(&alice, "hi")]));
    let (engine, _) = engine_with(connector, 100).await;

    let req = SyncRequest {
        pubkeys: vec![alice.public_key().to_bech32().unwrap()],
        ..SyncRequest::default()
    };
    let job = run_to_end(&engine, req).await;

    assert_eq!(job.pubkeys, vec![alice.public_key().to_hex()]);
    assert_eq!(job.relays, vec![RELAY_A.to_string()]);
    assert_eq!(job.events_stored, 1);
}

// =============================================================================
// Concurrency and cancellation
// =============================================================================

#[tokio::test]
async fn second_start_conflicts_without_new_row() {
    let alice = Keys::generate();
    let connector = FakeConnector::default().with(RELAY_A, FakeRelay::default().hanging());
    let (engine, _) = engine_with(connector, 100).await;

    let first = engine
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap();
    let err = engine
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap_err();

    assert!(matches!(err, AdminError::Conflict(_)));
    assert_eq!(engine.list_jobs(10).await.unwrap().len(), 1);
    assert_eq!(engine.current_job_id().await, Some(first));

    engine.shutdown().await;
}

#[tokio::test]
async fn second_process_conflicts_with_live_job_on_shared_db() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("admin.db");
    let alice = Keys::generate();
    let connector = || {
        Arc::new(FakeConnector::default().with(RELAY_A, FakeRelay::default().hanging()))
    };

    let daemon = SyncEngine::new(
        AdminDatabase::open(&db_path).await.unwrap(),
        EventStore::open_in_memory().await.unwrap(),
        connector(),
        sync_config(100),
    );
    let live = daemon
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap();

    let cli = SyncEngine::new(
        AdminDatabase::open(&db_path).await.unwrap(),
        EventStore::open_in_memory().await.unwrap(),
        connector(),
        sync_config(100),
    );
    let err = cli
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap_err();

    assert!(matches!(err, AdminError::Conflict(_)));
    assert!(cli.current_job_id().await.is_none());
    assert_eq!(cli.get_job(&live).await.unwrap().status, SyncStatus::Running);
    assert_eq!(cli.list_jobs(10).await.unwrap().len(), 1);

    daemon.shutdown().await;
    assert_eq!(
        cli.get_job(&live).await.unwrap().status,
        SyncStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_marks_cancelled_and_freezes_progress() {
    let alice = Keys::generate();
    let notes: Vec<Event> = (0..5).map(|i| note(&alice, &format!("n{i}"))).collect();
    let connector =
        FakeConnector::default().with(RELAY_A, FakeRelay::with_events(&notes).hanging());
    let (engine, events) = engine_with(connector, 2).await;

    let id = engine
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap();
    wait_for_fetched(&engine, &id, 4).await;

    assert_eq!(engine.cancel_sync().await.unwrap(), id);
    engine.wait().await;

    let job = engine.get_job(&id).await.unwrap();
    assert_eq!(job.status, SyncStatus::Cancelled);
    assert_eq!(job.events_fetched, 4);
    assert!(events.count_events().await.unwrap() >= 4);
    assert!(engine.current_job_id().await.is_none());
}

#[tokio::test]
async fn cancel_without_job_is_not_found() {
    let (engine, _) = engine_with(FakeConnector::default(), 100).await;
    assert!(matches!(
        engine.cancel_sync().await,
        Err(AdminError::NotFound(_))
    ));
}

#[tokio::test]
async fn new_job_allowed_after_cancel() {
    let alice = Keys::generate();
    let connector = FakeConnector::default().with(RELAY_A, FakeRelay::default().hanging());
    let (engine, _) = engine_with(connector, 100).await;

    engine
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap();
    engine.shutdown().await;

    engine
        .start_sync(request(&[&alice], &[RELAY_A]))
        .await
        .unwrap();
    engine.shutdown().await;

    let jobs = engine.list_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == SyncStatus::Cancelled));
}

// =============================================================================
// Read models
// =============================================================================

#[tokio::test]
async fn unknown_job_not_found() {
    let (engine, _) = engine_with(FakeConnector::default(), 100).await;
    assert!(matches!(
        engine.get_job("missing").await,
        Err(AdminError::NotFound(_))
    ));
}

#[tokio::test]
async fn recover_interrupted_fails_stale_rows() {
    let db = AdminDatabase::open_in_memory().await.unwrap();
    let pubkeys = vec!["aa".to_string()];
    let relays = vec![RELAY_A.to_string()];
    db.create_sync_job(&NewSyncJob {
        id: "stale",
        pubkeys: &pubkeys,
        relays: &relays,
        event_kinds: &[],
        since_timestamp: None,
    })
    .await
    .unwrap();

    let engine = SyncEngine::new(
        db,
        EventStore::open_in_memory().await.unwrap(),
        Arc::new(FakeConnector::default()),
        sync_config(100),
    );

    assert_eq!(engine.recover_interrupted().await.unwrap(), 1);
    assert_eq!(
        engine.get_job("stale").await.unwrap().status,
        SyncStatus::Failed
    );
}
