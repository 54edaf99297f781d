//! `SQLite` event database and its single-writer handle.

use std::path::Path;
use std::sync::Arc;

use nostr::Event;
use relaygate_core::db::{DatabaseError, unix_timestamp};
use sqlx::{QueryBuilder, Sqlite};
use tokio::sync::{Mutex, MutexGuard};

use super::exceptions::RetentionException;

const DELETE_CHUNK_SIZE: usize = 500;

relaygate_core::define_database!(
    EventDatabase,
    "./migrations/events",
    "Event database migrations complete"
);

/// Shared content store. Cloning shares the pool and the writer lock.
#[derive(Clone)]
pub struct EventStore {
    db: EventDatabase,
    write_lock: Arc<Mutex<()>>,
}

/// Exclusive write access to the content store, held for one operation.
pub struct EventWriter<'a> {
    db: &'a EventDatabase,
    _guard: MutexGuard<'a, ()>,
}

impl EventStore {
    pub fn new(db: EventDatabase) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::new(EventDatabase::open(path).await?))
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::new(EventDatabase::open_in_memory().await?))
    }

    /// Wait for exclusive write access.
    pub async fn writer(&self) -> EventWriter<'_> {
        EventWriter {
            db: &self.db,
            _guard: self.write_lock.lock().await,
        }
    }

    /// Author of a stored event, or `None` if the id is unknown.
    pub async fn get_event_author(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT pubkey FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn event_exists(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.get_event_author(id).await?.is_some())
    }

    #[cfg(test)]
    pub(crate) const fn pool(&self) -> &sqlx::Pool<Sqlite> {
        self.db.pool()
    }

    pub async fn count_events(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.0)
    }
}

impl EventWriter<'_> {
    /// Insert a verified event. Returns `false` if the id was already stored.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn insert_event(&self, event: &Event) -> Result<bool, DatabaseError> {
        let tags = serde_json::to_string(&event.tags)
            .map_err(|e| DatabaseError::Query(format!("Failed to encode tags: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO events (id, pubkey, kind, created_at, content, tags, sig, stored_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(event.id.to_hex())
        .bind(event.pubkey.to_hex())
        .bind(i64::from(event.kind.as_u16()))
        .bind(event.created_at.as_u64() as i64)
        .bind(&event.content)
        .bind(tags)
        .bind(event.sig.to_string())
        .bind(unix_timestamp())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete events created before `cutoff`, sparing exceptions and the operator.
    pub async fn delete_events_before(
        &self,
        cutoff: i64,
        exceptions: &[RetentionException],
        operator_pubkey: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM events WHERE created_at < ");
        builder.push_bind(cutoff);

        for exception in exceptions {
            match exception {
                RetentionException::Kind(kind) => {
                    builder.push(" AND kind != ");
                    builder.push_bind(i64::from(*kind));
                }
                RetentionException::KindRange { start, end } => {
                    builder.push(" AND kind NOT BETWEEN ");
                    builder.push_bind(i64::from(*start));
                    builder.push(" AND ");
                    builder.push_bind(i64::from(*end));
                }
                RetentionException::Pubkey(pubkey) => {
                    builder.push(" AND pubkey != ");
                    builder.push_bind(pubkey.clone());
                }
            }
        }

        if let Some(operator) = operator_pubkey {
            builder.push(" AND pubkey != ");
            builder.push_bind(operator.to_string());
        }

        let result = builder.build().execute(self.db.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Delete the given ids in one transaction. Unknown ids are ignored.
    ///
    /// Ids are bound in chunks to stay under the `SQLite` parameter limit.
    pub async fn delete_events_by_ids(&self, ids: &[String]) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db.pool().begin().await?;
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM events WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Timestamp};

    fn event(keys: &Keys, kind: u16, created_at: u64) -> Event {
        EventBuilder::new(Kind::from(kind), format!("kind {kind} at {created_at}"))
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    async fn store_with(events: &[&Event]) -> EventStore {
        let store = EventStore::open_in_memory().await.unwrap();
        let writer = store.writer().await;
        for ev in events {
            assert!(writer.insert_event(ev).await.unwrap());
        }
        drop(writer);
        store
    }

    #[tokio::test]
    async fn insert_reports_duplicates() {
        let keys = Keys::generate();
        let ev = event(&keys, 1, 1_000);
        let store = store_with(&[&ev]).await;

        assert!(!store.writer().await.insert_event(&ev).await.unwrap());
        assert_eq!(store.count_events().await.unwrap(), 1);
        assert_eq!(
            store.get_event_author(&ev.id.to_hex()).await.unwrap(),
            Some(keys.public_key().to_hex())
        );
    }

    #[tokio::test]
    async fn delete_by_ids_spans_chunks() {
        let keys = Keys::generate();
        let stored: Vec<Event> = (0..3).map(|i| event(&keys, 1, 1_000 + i)).collect();
        let store = store_with(&stored.iter().collect::<Vec<_>>()).await;

        // Pad with unknown ids so the request crosses several chunks.
        let mut ids: Vec<String> = (0..DELETE_CHUNK_SIZE * 2)
            .map(|i| format!("{i:064x}"))
            .collect();
        ids.extend(stored.iter().map(|ev| ev.id.to_hex()));

        let deleted = store.writer().await.delete_events_by_ids(&ids).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_event_has_no_author() {
        let store = EventStore::open_in_memory().await.unwrap();
        assert!(store.get_event_author("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_before_cutoff_spares_newer_events() {
        let keys = Keys::generate();
        let old = event(&keys, 1, 1_000);
        let new = event(&keys, 1, 5_000);
        let store = store_with(&[&old, &new]).await;

        let deleted = store
            .writer()
            .await
            .delete_events_before(2_000, &[], None)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(!store.event_exists(&old.id.to_hex()).await.unwrap());
        assert!(store.event_exists(&new.id.to_hex()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_before_honors_exceptions_and_operator() {
        let operator = Keys::generate();
        let someone = Keys::generate();
        let pinned = Keys::generate();
        let profile = event(&someone, 0, 1_000);
        let long_form = event(&someone, 30_023, 1_000);
        let note = event(&someone, 1, 1_000);
        let operator_note = event(&operator, 1, 1_000);
        let pinned_note = event(&pinned, 1, 1_000);
        let store =
            store_with(&[&profile, &long_form, &note, &operator_note, &pinned_note]).await;

        let exceptions = vec![
            RetentionException::Kind(0),
            RetentionException::KindRange {
                start: 30_000,
                end: 39_999,
            },
            RetentionException::Pubkey(pinned.public_key().to_hex()),
        ];
        let operator_hex = operator.public_key().to_hex();
        let deleted = store
            .writer()
            .await
            .delete_events_before(2_000, &exceptions, Some(&operator_hex))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(!store.event_exists(&note.id.to_hex()).await.unwrap());
        assert_eq!(store.count_events().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn delete_by_ids_ignores_unknown() {
        let keys = Keys::generate();
        let a = event(&keys, 1, 1_000);
        let b = event(&keys, 1, 1_001);
        let store = store_with(&[&a, &b]).await;

        let writer = store.writer().await;
        assert_eq!(writer.delete_events_by_ids(&[]).await.unwrap(), 0);
        let deleted = writer
            .delete_events_by_ids(&[a.id.to_hex(), "f".repeat(64)])
            .await
            .unwrap();
        drop(writer);

        assert_eq!(deleted, 1);
        assert_eq!(store.count_events().await.unwrap(), 1);
    }
}
