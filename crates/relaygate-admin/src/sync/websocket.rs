//! NIP-01 websocket client for peer relays.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::Event;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::client::{RelayClient, RelayConnector, RelayError, SyncFilter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to peer relays over `ws://` / `wss://`.
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { connect_timeout }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelayClient>, RelayError> {
        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| RelayError::Timeout(url.to_string()))?
        .map_err(|e| RelayError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        debug!(relay = %url, "Connected to peer relay");

        Ok(Box::new(WebSocketRelay {
            url: url.to_string(),
            ws,
            subscription_id: None,
            counter: 0,
        }))
    }
}

struct WebSocketRelay {
    url: String,
    ws: WsStream,
    subscription_id: Option<String>,
    counter: u64,
}

/// Relay-to-client frames relevant to a backfill subscription.
#[derive(Debug)]
enum RelayFrame {
    Event(Box<Event>),
    Eose,
    Closed(String),
    /// NOTICE, OK, AUTH, or frames for another subscription.
    Ignored,
}

fn parse_frame(text: &str, subscription_id: &str) -> Result<RelayFrame, RelayError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))?;
    let Some(items) = value.as_array() else {
        return Err(RelayError::Protocol("frame is not an array".into()));
    };

    let kind = items.first().and_then(Value::as_str).unwrap_or_default();
    let for_us = items.get(1).and_then(Value::as_str) == Some(subscription_id);

    match kind {
        "EVENT" if for_us => {
            let raw = items
                .get(2)
                .cloned()
                .ok_or_else(|| RelayError::Protocol("EVENT without payload".into()))?;
            let event: Event =
                serde_json::from_value(raw).map_err(|e| RelayError::Protocol(e.to_string()))?;
            Ok(RelayFrame::Event(Box::new(event)))
        }
        "EOSE" if for_us => Ok(RelayFrame::Eose),
        "CLOSED" if for_us => Ok(RelayFrame::Closed(
            items
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        "NOTICE" => {
            if let Some(msg) = items.get(1).and_then(Value::as_str) {
                debug!(notice = %msg, "Relay notice");
            }
            Ok(RelayFrame::Ignored)
        }
        _ => Ok(RelayFrame::Ignored),
    }
}

impl WebSocketRelay {
    async fn send_json(&mut self, value: &Value) -> Result<(), RelayError> {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .map_err(|e| RelayError::Disconnected(e.to_string()))
    }

    async fn close_subscription(&mut self) -> Result<(), RelayError> {
        if let Some(id) = self.subscription_id.take() {
            self.send_json(&json!(["CLOSE", id])).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RelayClient for WebSocketRelay {
    async fn subscribe(&mut self, filter: &SyncFilter) -> Result<(), RelayError> {
        self.close_subscription().await?;

        self.counter += 1;
        let id = format!("relaygate-sync-{}", self.counter);
        self.send_json(&json!(["REQ", id, filter.to_filter()])).await?;
        self.subscription_id = Some(id);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Event>, RelayError> {
        let Some(sub_id) = self.subscription_id.clone() else {
            return Ok(None);
        };

        loop {
            let msg = match self.ws.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(RelayError::Disconnected(e.to_string())),
                None => return Err(RelayError::Disconnected("stream ended".into())),
            };

            match msg {
                Message::Text(text) => match parse_frame(&text, &sub_id) {
                    Ok(RelayFrame::Event(event)) => return Ok(Some(*event)),
                    Ok(RelayFrame::Eose) => return Ok(None),
                    Ok(RelayFrame::Closed(reason)) => {
                        self.subscription_id = None;
                        return Err(RelayError::Closed(reason));
                    }
                    Ok(RelayFrame::Ignored) => {}
                    Err(e) => warn!(relay = %self.url, error = %e, "Dropping malformed frame"),
                },
                Message::Ping(payload) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => {
                    return Err(RelayError::Disconnected("closed by relay".into()));
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.close_subscription().await;
        let _ = self.ws.close(None).await;
        debug!(relay = %self.url, "Disconnected from peer relay");
    }
}
