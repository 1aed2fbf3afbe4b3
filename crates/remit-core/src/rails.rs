//! Bank rail seam.
//!
//! The dispatch implementations (circuit breaking, retry, dry-run,
//! mock/real/shadow providers) live in the `remit-rails` crate; this
//! module owns the contract they implement so the release engine depends
//! only on the seam.

use crate::error::RemitError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// External payment network operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RailKind {
    Eft,
    Bpay,
    PayToSweep,
    PayToDebit,
}

impl RailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eft => "eft",
            Self::Bpay => "bpay",
            Self::PayToSweep => "payto_sweep",
            Self::PayToDebit => "payto_debit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "eft" => Some(Self::Eft),
            "bpay" => Some(Self::Bpay),
            "payto_sweep" => Some(Self::PayToSweep),
            "payto_debit" => Some(Self::PayToDebit),
            _ => None,
        }
    }
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound transfer instruction. `amount_cents` is the positive debit
/// magnitude; the ledger keeps the signed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailRequest {
    pub kind: RailKind,
    pub amount_cents: i64,
    pub destination: String,
    pub reference: String,
    /// Mandatory: every state-mutating rail call must be replay-safe.
    pub idempotency_key: String,
}

/// Successful dispatch outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailReceipt {
    pub provider_reference: String,
    pub raw: Value,
    /// True when no real network transfer occurred (mock or dry-run).
    pub synthetic: bool,
}

/// Pluggable rail provider. Implementations map release instructions to
/// an external rail while preserving idempotency-key propagation.
#[async_trait]
pub trait RailProvider: Send + Sync {
    fn rail_id(&self) -> &'static str;

    async fn eft(&self, request: &RailRequest) -> Result<RailReceipt, RemitError>;

    async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError>;

    async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError>;

    async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError>;

    /// Route on the request's rail kind.
    async fn dispatch(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        match request.kind {
            RailKind::Eft => self.eft(request).await,
            RailKind::Bpay => self.bpay(request).await,
            RailKind::PayToSweep => self.payto_sweep(request).await,
            RailKind::PayToDebit => self.payto_debit(request).await,
        }
    }
}
