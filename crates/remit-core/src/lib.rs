//! Core remittance runtime.
//!
//! This crate owns the period state machine, the hash-chained OWA
//! ledger, signed release-token issuance and verification across
//! pluggable KMS backends, reconciliation of bank statements and
//! settlement webhooks, and the release engine that ties them together
//! under per-period serialization.

#![deny(unsafe_code)]

pub mod canonical;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod kms;
pub mod ledger;
pub mod period;
pub mod rails;
pub mod recon;
pub mod rpt;
pub mod settlement;
pub mod storage;
pub mod tls;
pub mod types;

pub use engine::{
    CloseInputs, EngineConfig, LedgerProof, PeriodView, ReleaseOutcome, RemitEngine,
};
pub use error::RemitError;
pub use idempotency::{IdempotencyStore, KeyVisit};
pub use kms::{CloudKms, KmsProvider, KmsVerifier, LocalKms, RemoteKms};
pub use tls::MtlsMaterial;
pub use ledger::{OwaLedger, GENESIS_HASH};
pub use period::{anomaly_breaches, evaluate_transition, TransitionDecision};
pub use rails::{RailKind, RailProvider, RailReceipt, RailRequest};
pub use recon::{ReconEngine, StatementConfig, StatementIngestReport};
pub use rpt::{verify_token, RptIssuer, RptVerification};
pub use settlement::{
    ReleaseComponents, SettlementIngestReport, SettlementLedger, SettlementRow,
};
pub use storage::{PeriodCell, PeriodStore, PostgresMirror, StorageConfig};
pub use types::{
    AnomalyThresholds, AnomalyVector, BankStatementLine, BlockReason, IdempotencyRecord,
    IdempotencyStatus, LedgerEntry, LineStatus, MatchStrategy, MetricBreach, Period, PeriodKey,
    PeriodState, ReleaseRecord, ReleaseRequest, ReleaseResponse, RptPayload, RptStatus, RptToken,
    SettlementComponent, TaxType,
};
