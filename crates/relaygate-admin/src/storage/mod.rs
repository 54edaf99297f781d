//! `SQLite` storage for the `RelayGate` admin control plane.
//!
//! Persists sync jobs, pricing tiers, invoices, grants, the whitelist,
//! retention policy, deletion requests and the audit log.

mod db;
mod models;
mod queries_access;
mod queries_audit;
mod queries_payments;
mod queries_retention;
mod queries_sync;


pub use db::{AdminDatabase, DatabaseError};
pub use models::*;
pub use queries_access::{GrantParams, TierParams, WhitelistParams};
pub use queries_payments::{InvoiceParams, PaymentRecordParams};
pub use queries_retention::DeletionRequestParams;
pub use queries_sync::NewSyncJob;
