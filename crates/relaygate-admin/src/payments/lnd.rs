//! LND REST client.
//!
//! Uses reqwest against `/v1/invoices`, `/v1/invoice/{hash}` and the
//! newline-delimited `/v1/invoices/subscribe` stream.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use relaygate_core::config::PaymentsConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::backend::{CreatedInvoice, PaymentBackend, PaymentError};

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for an LND node.
#[derive(Debug, Clone)]
pub struct LndConfig {
    /// REST endpoint, e.g. `https://127.0.0.1:8080`.
    pub url: String,
    pub macaroon_hex: String,
    /// PEM of the node's TLS certificate, trusted in addition to web roots.
    pub tls_cert_pem: Option<Vec<u8>>,
}

impl LndConfig {
    pub fn from_settings(settings: &PaymentsConfig) -> Result<Self, PaymentError> {
        let url = settings
            .lnd_url
            .clone()
            .ok_or_else(|| PaymentError::Config("payments.lnd_url is not set".into()))?;
        let tls_cert_pem = settings
            .tls_cert_path
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|e| {
                    PaymentError::Config(format!("Cannot read {}: {e}", path.display()))
                })
            })
            .transpose()?;

        Ok(Self {
            url,
            macaroon_hex: settings.macaroon_hex.clone().unwrap_or_default(),
            tls_cert_pem,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Default, Deserialize)]
struct LndInvoice {
    #[serde(default)]
    r_hash: String,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    state: String,
}

impl LndInvoice {
    fn is_settled(&self) -> bool {
        self.settled || self.state == "SETTLED"
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    result: Option<LndInvoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct LndClient {
    http: reqwest::Client,
    base_url: String,
}

impl LndClient {
    pub fn new(config: &LndConfig) -> Result<Self, PaymentError> {
        if config.url.is_empty() {
            return Err(PaymentError::Config("LND url is empty".into()));
        }
        if hex::decode(&config.macaroon_hex).is_err() {
            return Err(PaymentError::Config("Macaroon must be hex-encoded".into()));
        }

        let mut headers = HeaderMap::new();
        if !config.macaroon_hex.is_empty() {
            let macaroon = HeaderValue::from_str(&config.macaroon_hex)
                .map_err(|_| PaymentError::Config("Invalid macaroon".into()))?;
            headers.insert(MACAROON_HEADER, macaroon);
        }

        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(pem) = &config.tls_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| PaymentError::Config(format!("Invalid TLS certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build()?;

        let base_url = config.url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PaymentError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };
        Err(PaymentError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// LND returns hashes as standard base64; the rest of the system uses hex.
fn base64_hash_to_hex(r_hash: &str) -> Result<String, PaymentError> {
    let bytes = BASE64
        .decode(r_hash)
        .map_err(|e| PaymentError::Decode(format!("r_hash is not base64: {e}")))?;
    if bytes.len() != 32 {
        return Err(PaymentError::Decode(format!(
            "r_hash has {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(hex::encode(bytes))
}

fn validate_hash(payment_hash: &str) -> Result<(), PaymentError> {
    match hex::decode(payment_hash) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(PaymentError::Config(format!(
            "Invalid payment hash: {payment_hash}"
        ))),
    }
}

/// Hex hash of a settled invoice in one stream line, if any.
fn parse_stream_line(line: &[u8]) -> Result<Option<String>, PaymentError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }

    let frame: StreamFrame =
        serde_json::from_slice(line).map_err(|e| PaymentError::Decode(e.to_string()))?;
    if let Some(error) = frame.error {
        return Err(PaymentError::Api {
            status: 0,
            message: error.to_string(),
        });
    }

    match frame.result {
        Some(invoice) if invoice.is_settled() => base64_hash_to_hex(&invoice.r_hash).map(Some),
        _ => Ok(None),
    }
}

#[async_trait]
impl PaymentBackend for LndClient {
    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: i64,
    ) -> Result<CreatedInvoice, PaymentError> {
        let body = json!({
            "value": amount_sats.to_string(),
            "memo": memo,
            "expiry": expiry_secs.to_string(),
        });
        let resp = self
            .http
            .post(self.api_url("/invoices"))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let created: AddInvoiceResponse = Self::check_status(resp).await?.json().await?;

        Ok(CreatedInvoice {
            payment_hash: base64_hash_to_hex(&created.r_hash)?,
            payment_request: created.payment_request,
        })
    }

    async fn check_invoice(&self, payment_hash: &str) -> Result<bool, PaymentError> {
        validate_hash(payment_hash)?;
        let resp = self
            .http
            .get(self.api_url(&format!("/invoice/{payment_hash}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let invoice: LndInvoice = Self::check_status(resp).await?.json().await?;
        Ok(invoice.is_settled())
    }

    async fn subscribe_settlements(
        &self,
        settled: mpsc::Sender<String>,
    ) -> Result<(), PaymentError> {
        let resp = self
            .http
            .get(self.api_url("/invoices/subscribe"))
            .send()
            .await?;
        let mut resp = Self::check_status(resp).await?;
        info!("Subscribed to LND invoice updates");

        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(hash) = parse_stream_line(&line)? {
                    debug!(payment_hash = %hash, "Settlement pushed by LND");
                    if settled.send(hash).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}
