use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tax obligation type a period accrues under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaxType {
    #[serde(rename = "PAYGW")]
    Paygw,
    #[serde(rename = "GST")]
    Gst,
}

impl TaxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paygw => "PAYGW",
            Self::Gst => "GST",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PAYGW" => Some(Self::Paygw),
            "GST" => Some(Self::Gst),
            _ => None,
        }
    }
}

impl fmt::Display for TaxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key identifying one remittance period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey {
    pub abn: String,
    pub tax_type: TaxType,
    pub period_id: String,
}

impl PeriodKey {
    pub fn new(abn: impl Into<String>, tax_type: TaxType, period_id: impl Into<String>) -> Self {
        Self {
            abn: abn.into(),
            tax_type,
            period_id: period_id.into(),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.abn, self.tax_type, self.period_id)
    }
}

/// Period lifecycle states. `Released` and the blocked states are
/// terminal; blocked states clear only through explicit re-evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodState {
    Open,
    Closing,
    BlockedAnomaly,
    BlockedDiscrepancy,
    ReadyRpt,
    Released,
}

impl PeriodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::BlockedAnomaly => "BLOCKED_ANOMALY",
            Self::BlockedDiscrepancy => "BLOCKED_DISCREPANCY",
            Self::ReadyRpt => "READY_RPT",
            Self::Released => "RELEASED",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::BlockedAnomaly | Self::BlockedDiscrepancy)
    }
}

impl fmt::Display for PeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistical signals evaluated against operator thresholds before release.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AnomalyVector {
    pub variance_ratio: f64,
    pub dup_rate: f64,
    pub gap_minutes: f64,
    pub delta_vs_baseline: f64,
}

/// Operator-configured ceilings per anomaly metric plus the discrepancy
/// tolerance between accrued liability and credited ledger balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnomalyThresholds {
    pub variance_ratio: f64,
    pub dup_rate: f64,
    pub gap_minutes: f64,
    pub delta_vs_baseline: f64,
    pub epsilon_cents: i64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            variance_ratio: 0.25,
            dup_rate: 0.05,
            gap_minutes: 60.0,
            delta_vs_baseline: 0.20,
            epsilon_cents: 100,
        }
    }
}

/// One anomaly metric breaching its ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricBreach {
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
}

/// Machine-readable record of why a period blocked, persisted on the
/// period row so operators see the offending values, not just the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum BlockReason {
    Anomaly { breaches: Vec<MetricBreach> },
    Discrepancy { epsilon_cents: i64, threshold_cents: i64 },
}

/// One remittance period from accrual through release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Period {
    pub key: PeriodKey,
    pub state: PeriodState,
    pub accrued_cents: i64,
    pub credited_to_owa_cents: i64,
    pub final_liability_cents: i64,
    /// Denormalized ledger summaries, refreshed on every append.
    pub merkle_root: String,
    pub running_balance_hash: String,
    pub anomaly_vector: AnomalyVector,
    pub thresholds: AnomalyThresholds,
    /// Version identifier of the rate tables in force; flows through for
    /// auditability only.
    pub rate_version: Option<String>,
    pub block_reason: Option<BlockReason>,
    pub updated_at: DateTime<Utc>,
}

impl Period {
    pub fn open(key: PeriodKey, thresholds: AnomalyThresholds) -> Self {
        Self {
            key,
            state: PeriodState::Open,
            accrued_cents: 0,
            credited_to_owa_cents: 0,
            final_liability_cents: 0,
            merkle_root: String::new(),
            running_balance_hash: String::new(),
            anomaly_vector: AnomalyVector::default(),
            thresholds,
            rate_version: None,
            block_reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable hash-chained ledger row. Created only by a successful
/// deposit or release; never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub seq: u64,
    /// Signed cents: positive = credit/deposit, negative = debit/release.
    pub amount_cents: i64,
    pub balance_after_cents: i64,
    pub bank_receipt_id: String,
    pub bank_receipt_hash: String,
    pub prev_hash: String,
    pub hash_after: String,
    pub recorded_at: DateTime<Utc>,
}

/// Release-authorization token lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RptStatus {
    Pending,
    Active,
    Expired,
    Consumed,
}

/// Canonical RPT payload. The field list is fixed; the canonical
/// serialization of exactly these fields is what gets hashed and signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RptPayload {
    pub abn: String,
    pub period_id: String,
    pub tax_type: TaxType,
    pub amount_cents: i64,
    pub merkle_root: String,
    pub running_balance_hash: String,
    pub anomaly_vector: AnomalyVector,
    pub thresholds: AnomalyThresholds,
    pub rail_id: String,
    pub reference: String,
    pub expiry_ts: DateTime<Utc>,
    pub nonce: String,
}

/// A signed release authorization. At most one active, non-expired token
/// exists per period; issuing a replacement supersedes the prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RptToken {
    pub payload: RptPayload,
    pub canonical: String,
    pub payload_sha256: String,
    /// Base64-encoded detached Ed25519 signature over the canonical bytes.
    pub signature: String,
    pub key_id: String,
    pub status: RptStatus,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

/// Bank-feed statement line resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineStatus {
    Unresolved,
    Matched,
}

/// How a statement line was matched to a release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStrategy {
    /// Line already carried a match from a prior ingestion.
    Previous,
    /// Exact reference and amount.
    Reference,
    /// Amount within one cent and dates within two days.
    Fuzzy,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Previous => "PREVIOUS",
            Self::Reference => "REFERENCE",
            Self::Fuzzy => "FUZZY",
        }
    }
}

/// External bank-feed row, upserted by `bank_txn_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankStatementLine {
    pub bank_txn_id: String,
    pub amount_cents: i64,
    pub reference: String,
    /// Posting date after cutoff-hour and weekend adjustment.
    pub statement_date: NaiveDate,
    pub status: LineStatus,
    pub matched_release_uuid: Option<Uuid>,
    pub match_strategy: Option<MatchStrategy>,
}

/// Release registered for reconciliation: the debit magnitude, its
/// remittance reference, and the date funds left the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub release_uuid: Uuid,
    pub bank_receipt_id: String,
    pub reference: String,
    /// Positive debit magnitude.
    pub amount_cents: i64,
    pub released_on: NaiveDate,
    pub matched: bool,
}

/// Settlement component of a release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementComponent {
    Gst,
    Net,
}

impl SettlementComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gst => "GST",
            Self::Net => "NET",
        }
    }
}

impl fmt::Display for SettlementComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency record outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Applied,
    Failed,
}

/// Cached outcome for one idempotency key. Finalized exactly once and
/// replayed verbatim on every identical key within TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub http_status: u16,
    pub response_body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Inbound release request. Wire fields are camelCase; the response
/// deliberately stays snake_case to match downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub abn: String,
    pub tax_type: TaxType,
    pub period_id: String,
    /// Must be negative: releases debit the ledger.
    pub amount_cents: i64,
    pub destination: String,
    #[serde(default = "default_rail")]
    pub rail: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Optional client echo of the active token digest; when present it
    /// must match the token being consumed.
    #[serde(default)]
    pub rpt: Option<String>,
}

fn default_rail() -> String {
    "eft".to_string()
}

impl ReleaseRequest {
    pub fn key(&self) -> PeriodKey {
        PeriodKey::new(self.abn.clone(), self.tax_type, self.period_id.clone())
    }
}

/// Successful release outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub ok: bool,
    pub ledger_id: Uuid,
    pub transfer_uuid: Uuid,
    pub release_uuid: Uuid,
    pub bank_receipt_id: String,
    pub balance_after_cents: i64,
    pub idempotency_key: String,
}
