//! Lightning payments: invoice issuing and settlement reconciliation.

mod backend;
mod lnd;
mod reconciler;

pub use backend::{CreatedInvoice, PaymentBackend, PaymentError};
pub use lnd::{LndClient, LndConfig};
pub use reconciler::{PaymentReconciler, SettlementOutcome};
