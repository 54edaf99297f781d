//! Narrow peer-relay interface consumed by the sync engine.

use async_trait::async_trait;
use nostr::{Event, Filter, Kind, PublicKey, Timestamp};

use crate::error::AdminError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Connecting to {0} timed out")]
    Timeout(String),

    #[error("Relay closed the subscription: {0}")]
    Closed(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Whether the connection itself is unusable, as opposed to one
    /// subscription failing on a healthy socket.
    pub const fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout(_) | Self::Disconnected(_)
        )
    }
}

impl From<RelayError> for AdminError {
    fn from(e: RelayError) -> Self {
        Self::TransientExternal(e.to_string())
    }
}

/// Subscription for one author on one relay.
#[derive(Debug, Clone)]
pub struct SyncFilter {
    pub author: PublicKey,
    pub kinds: Vec<u16>,
    pub since: Option<i64>,
}

impl SyncFilter {
    #[allow(clippy::cast_sign_loss)]
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new().author(self.author);
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied().map(Kind::from));
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since.max(0) as u64));
        }
        filter
    }
}

/// Opens connections to peer relays.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayClient>, RelayError>;
}

/// A live connection to one peer relay.
///
/// Only one subscription is active at a time; `subscribe` replaces it.
#[async_trait]
pub trait RelayClient: Send {
    async fn subscribe(&mut self, filter: &SyncFilter) -> Result<(), RelayError>;

    /// Next stored event of the active subscription, or `None` once the relay
    /// has sent everything it holds. Must be cancel-safe.
    async fn next_event(&mut self) -> Result<Option<Event>, RelayError>;

    async fn close(&mut self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn filter_includes_author_kinds_and_since() {
        let keys = Keys::generate();
        let filter = SyncFilter {
            author: keys.public_key(),
            kinds: vec![1, 30023],
            since: Some(1_700_000_000),
        }
        .to_filter();

        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["authors"][0], keys.public_key().to_hex());
        assert_eq!(json["since"], 1_700_000_000);
        let kinds = json["kinds"].as_array().unwrap();
        assert_eq!(kinds.len(), 2);
    }

    #[test]
    fn filter_omits_unset_fields() {
        let filter = SyncFilter {
            author: Keys::generate().public_key(),
            kinds: Vec::new(),
            since: None,
        }
        .to_filter();

        let json = serde_json::to_value(&filter).unwrap();
        assert!(json.get("kinds").is_none());
        assert!(json.get("since").is_none());
    }

    #[test]
    fn relay_errors_are_transient() {
        let err: AdminError = RelayError::Timeout("wss://x".into()).into();
        assert!(matches!(err, AdminError::TransientExternal(_)));
    }
}
