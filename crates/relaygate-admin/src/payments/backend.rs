//! Narrow payment backend interface consumed by the reconciler.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AdminError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payment backend error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed backend response: {0}")]
    Decode(String),
}

impl From<PaymentError> for AdminError {
    fn from(e: PaymentError) -> Self {
        Self::TransientExternal(e.to_string())
    }
}

/// Invoice freshly created by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInvoice {
    /// Hex-encoded payment hash.
    pub payment_hash: String,
    /// BOLT11 string to show the payer.
    pub payment_request: String,
}

#[async_trait]
pub trait PaymentBackend: Send + Sync + 'static {
    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: i64,
    ) -> Result<CreatedInvoice, PaymentError>;

    /// Whether the invoice with this hex payment hash has been settled.
    async fn check_invoice(&self, payment_hash: &str) -> Result<bool, PaymentError>;

    /// Stream hex payment hashes of settled invoices into `settled`.
    ///
    /// Returns when the backend closes the stream or the receiver is dropped.
    async fn subscribe_settlements(
        &self,
        settled: mpsc::Sender<String>,
    ) -> Result<(), PaymentError>;
}
