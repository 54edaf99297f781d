//! Content lifecycle through the service wiring: mirror events from a peer
//! relay, honor a deletion request, then prune by age.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use nostr::{Event, EventBuilder, Keys, Kind, Tag, Timestamp};
use relaygate_admin::access::DetachedRelay;
use relaygate_admin::events::EventStore;
use relaygate_admin::storage::{AdminDatabase, DeletionStatus, RetentionPolicy, SyncStatus};
use relaygate_admin::sync::{RelayClient, RelayConnector, RelayError, SyncFilter, SyncRequest};
use relaygate_admin::{ServiceDeps, Services};
use relaygate_core::config::Config;
use relaygate_core::db::{SECS_PER_DAY, unix_timestamp};

struct PeerRelay {
    events: Vec<Event>,
}

struct PeerClient {
    events: Vec<Event>,
    queue: VecDeque<Event>,
}

#[async_trait]
impl RelayConnector for PeerRelay {
    async fn connect(&self, _url: &str) -> Result<Box<dyn RelayClient>, RelayError> {
        Ok(Box::new(PeerClient {
            events: self.events.clone(),
            queue: VecDeque::new(),
        }))
    }
}

#[async_trait]
impl RelayClient for PeerClient {
    async fn subscribe(&mut self, filter: &SyncFilter) -> Result<(), RelayError> {
        self.queue = self
            .events
            .iter()
            .filter(|ev| ev.pubkey == filter.author)
            .cloned()
            .collect();
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Event>, RelayError> {
        Ok(self.queue.pop_front())
    }

    async fn close(&mut self) {}
}

#[allow(clippy::cast_sign_loss)]
fn note(keys: &Keys, content: &str, created_at: i64) -> Event {
    EventBuilder::new(Kind::TextNote, content)
        .custom_created_at(Timestamp::from(created_at as u64))
        .sign_with_keys(keys)
        .unwrap()
}

#[tokio::test]
async fn sync_then_delete_then_prune() {
    let alice = Keys::generate();
    let now = unix_timestamp();
    let fresh = note(&alice, "fresh", now - 60);
    let regretted = note(&alice, "regretted", now - 120);
    let ancient = note(&alice, "ancient", now - 400 * SECS_PER_DAY);

    let db = AdminDatabase::open_in_memory().await.unwrap();
    let events = EventStore::open_in_memory().await.unwrap();
    let deps = ServiceDeps {
        db: db.clone(),
        events: events.clone(),
        connector: Arc::new(PeerRelay {
            events: vec![fresh.clone(), regretted.clone(), ancient.clone()],
        }),
        relay: Arc::new(DetachedRelay),
        payments: None,
    };
    let services = Services::new(deps, &Config::default()).unwrap();

    // Mirror.
    let job_id = services
        .sync()
        .start_sync(SyncRequest {
            pubkeys: vec![alice.public_key().to_hex()],
            relays: vec!["wss://peer.example".into()],
            ..SyncRequest::default()
        })
        .await
        .unwrap();
    services.sync().wait().await;

    let job = services.sync().get_job(&job_id).await.unwrap();
    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.events_stored, 3);
    assert_eq!(events.count_events().await.unwrap(), 3);

    // Deletion request by the author.
    let request = EventBuilder::new(Kind::from(5), "")
        .tags([Tag::event(regretted.id)])
        .sign_with_keys(&alice)
        .unwrap();
    let recorded = services
        .retention()
        .record_deletion_request(&request)
        .await
        .unwrap();

    // Age cutoff.
    services
        .retention()
        .update_policy(&RetentionPolicy {
            retention_days: 365,
            ..RetentionPolicy::default()
        })
        .await
        .unwrap();

    let report = services.retention().run_once().await.unwrap();
    assert_eq!(report.requested_deleted, 1);
    assert_eq!(report.expired_deleted, 1);

    let done = db.get_deletion_request(&recorded.id).await.unwrap();
    assert_eq!(done.status, DeletionStatus::Processed);
    assert!(events.event_exists(&fresh.id.to_hex()).await.unwrap());
    assert!(!events.event_exists(&regretted.id.to_hex()).await.unwrap());
    assert!(!events.event_exists(&ancient.id.to_hex()).await.unwrap());
}
