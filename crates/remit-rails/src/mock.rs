//! Deterministic rail providers for local settlement simulation and
//! chaos testing.

use async_trait::async_trait;
use remit_core::canonical::sha256_hex;
use remit_core::rails::{RailProvider, RailReceipt, RailRequest};
use remit_core::RemitError;
use serde_json::json;

/// Mock provider: the receipt derives from the idempotency key, so
/// replays of the same request reproduce the same reference.
#[derive(Debug, Clone, Default)]
pub struct MockRail;

impl MockRail {
    fn receipt(&self, request: &RailRequest) -> RailReceipt {
        let digest = sha256_hex(request.idempotency_key.as_bytes());
        RailReceipt {
            provider_reference: format!("{}-{}", request.kind.as_str(), &digest[..16]),
            raw: json!({
                "rail": request.kind.as_str(),
                "destination": request.destination,
                "reference": request.reference,
                "amount_cents": request.amount_cents,
            }),
            synthetic: true,
        }
    }
}

#[async_trait]
impl RailProvider for MockRail {
    fn rail_id(&self) -> &'static str {
        "mock"
    }

    async fn eft(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Ok(self.receipt(request))
    }

    async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Ok(self.receipt(request))
    }

    async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Ok(self.receipt(request))
    }

    async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Ok(self.receipt(request))
    }
}

/// Deterministic failing provider useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailRail {
    message: String,
    upstream_status: Option<u16>,
    transient: bool,
}

impl AlwaysFailRail {
    pub fn transient(message: impl Into<String>, upstream_status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            upstream_status,
            transient: true,
        }
    }

    pub fn rejecting(message: impl Into<String>, upstream_status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            upstream_status,
            transient: false,
        }
    }

    fn error(&self) -> RemitError {
        if self.transient {
            RemitError::Transient {
                message: self.message.clone(),
                upstream_status: self.upstream_status,
            }
        } else {
            RemitError::RailRejected {
                message: self.message.clone(),
                upstream_status: self.upstream_status,
            }
        }
    }
}

#[async_trait]
impl RailProvider for AlwaysFailRail {
    fn rail_id(&self) -> &'static str {
        "always-fail"
    }

    async fn eft(&self, _request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Err(self.error())
    }

    async fn bpay(&self, _request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Err(self.error())
    }

    async fn payto_sweep(&self, _request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Err(self.error())
    }

    async fn payto_debit(&self, _request: &RailRequest) -> Result<RailReceipt, RemitError> {
        Err(self.error())
    }
}
