//! Content sync: mirror historical events from peer relays into the local
//! content store.

mod client;
mod engine;
mod websocket;

pub use client::{RelayClient, RelayConnector, RelayError, SyncFilter};
pub use engine::{SyncEngine, SyncRequest};
pub use websocket::WebSocketConnector;
