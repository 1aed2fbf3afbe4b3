//! Real rail provider over HTTPS with mutual TLS.

use async_trait::async_trait;
use remit_core::rails::{RailKind, RailProvider, RailReceipt, RailRequest};
use remit_core::tls::MtlsMaterial;
use remit_core::RemitError;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpRailConfig {
    pub base_url: String,
    /// Transport-level bound; the dispatcher adds its own per-attempt
    /// timeout on top.
    pub timeout: Duration,
    pub mtls: Option<MtlsMaterial>,
}

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    amount_cents: i64,
    destination: &'a str,
    reference: &'a str,
}

/// Provider speaking the bank gateway's JSON API. TLS material loads at
/// construction; a bad deployment fails here, not on the first release.
pub struct HttpRail {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRail {
    pub fn new(config: HttpRailConfig) -> Result<Self, RemitError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(material) = &config.mtls {
            builder = material.apply(builder)?;
        }
        let client = builder
            .build()
            .map_err(|e| RemitError::Config(format!("failed to build rail http client: {e}")))?;
        Ok(Self {
            base_url: config.base_url,
            client,
        })
    }

    fn endpoint(&self, kind: RailKind) -> String {
        let path = match kind {
            RailKind::Eft => "eft",
            RailKind::Bpay => "bpay",
            RailKind::PayToSweep => "payto/sweep",
            RailKind::PayToDebit => "payto/debit",
        };
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn post_transfer(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        let response = self
            .client
            .post(self.endpoint(request.kind))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&TransferBody {
                amount_cents: request.amount_cents,
                destination: &request.destination,
                reference: &request.reference,
            })
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let raw: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::Object(Default::default()));

        if status.is_success() {
            let provider_reference = raw
                .get("receipt_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    RemitError::Integrity(
                        "rail response missing receipt_id on success".to_string(),
                    )
                })?;
            return Ok(RailReceipt {
                provider_reference,
                raw,
                synthetic: false,
            });
        }

        let message = raw
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("rail request failed")
            .to_string();
        // 5xx and throttling are transient and retryable; other 4xx are
        // final rejections.
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            Err(RemitError::transient_with_status(message, status.as_u16()))
        } else {
            Err(RemitError::RailRejected {
                message,
                upstream_status: Some(status.as_u16()),
            })
        }
    }
}

fn classify_transport(err: reqwest::Error) -> RemitError {
    if err.is_timeout() || err.is_connect() {
        RemitError::transient(format!("rail transport: {err}"))
    } else {
        RemitError::transient(format!("rail request failed: {err}"))
    }
}

#[async_trait]
impl RailProvider for HttpRail {
    fn rail_id(&self) -> &'static str {
        "http"
    }

    async fn eft(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.post_transfer(request).await
    }

    async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.post_transfer(request).await
    }

    async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.post_transfer(request).await
    }

    async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.post_transfer(request).await
    }
}
