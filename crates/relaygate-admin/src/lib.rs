//! `RelayGate` admin control plane
//!
//! Background engines for a self-hosted Nostr relay:
//! - Content sync from peer relays into the local event store
//! - Lightning payment reconciliation into access grants
//! - Content retention and NIP-09 deletion requests
//! - Expiry of time-limited grants
//! - Whitelist propagation to the running relay

pub mod access;
pub mod error;
pub mod events;
pub mod expiry;
pub mod payments;
pub mod retention;
pub mod services;
pub mod storage;
pub mod supervisor;
pub mod sync;

pub use error::{AdminError, Result};
pub use services::{ServiceDeps, Services};
