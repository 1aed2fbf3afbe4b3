//! Release engine: the orchestration root tying the period state
//! machine, ledger, RPT issuance, rail seam, and reconciliation together.
//!
//! Every mutating operation on a period runs under that period's row
//! lock; the release transaction holds it from token verification
//! through the ledger commit so two racing releases can never both
//! succeed. Unrelated periods share nothing.

use crate::error::RemitError;
use crate::idempotency::{IdempotencyStore, KeyVisit};
use crate::kms::{KmsProvider, KmsVerifier};
use crate::ledger::OwaLedger;
use crate::period::{evaluate_transition, TransitionDecision};
use crate::rails::{RailKind, RailProvider, RailRequest};
use crate::recon::{ReconEngine, StatementConfig, StatementIngestReport};
use crate::rpt::{verify_token, RptIssuer};
use crate::settlement::{ReleaseComponents, SettlementIngestReport, SettlementLedger};
use crate::storage::{PeriodCell, PeriodStore, PostgresMirror, StorageConfig};
use crate::types::{
    AnomalyThresholds, AnomalyVector, BankStatementLine, BlockReason, IdempotencyRecord,
    LedgerEntry, Period, PeriodKey, PeriodState, ReleaseRecord, ReleaseRequest, ReleaseResponse,
    RptStatus, RptToken, TaxType,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub statement: StatementConfig,
    pub rpt_ttl: Duration,
    /// `None` disables the allow-list (development); `Some` rejects any
    /// destination not present with a 403-class policy error.
    pub allowed_destinations: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            statement: StatementConfig::default(),
            rpt_ttl: Duration::minutes(15),
            allowed_destinations: None,
        }
    }
}

/// Inputs to a close (or re-evaluation) request. Liability and anomaly
/// signals are computed upstream; they arrive here as facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseInputs {
    pub final_liability_cents: i64,
    #[serde(default)]
    pub accrued_cents: Option<i64>,
    #[serde(default)]
    pub anomaly_vector: Option<AnomalyVector>,
    #[serde(default)]
    pub rate_version: Option<String>,
    #[serde(default = "CloseInputs::default_rail")]
    pub rail: RailKind,
    #[serde(default)]
    pub reference: Option<String>,
}

impl CloseInputs {
    fn default_rail() -> RailKind {
        RailKind::Eft
    }
}

/// Period snapshot plus its current token, for operators and evidence
/// export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodView {
    pub period: Period,
    pub rpt: Option<RptToken>,
}

/// Result of a release call: freshly executed, or an idempotent replay
/// of a previously finalized outcome.
#[derive(Debug)]
pub enum ReleaseOutcome {
    Completed(ReleaseResponse),
    Replayed(IdempotencyRecord),
}

/// Ledger verification report for evidence export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerProof {
    pub entry_count: usize,
    pub balance_cents: i64,
    pub latest_hash: String,
    pub merkle_root: String,
    pub chain_valid: bool,
    pub chain_error: Option<String>,
}

pub struct RemitEngine {
    store: PeriodStore,
    rail: Arc<dyn RailProvider>,
    verifier: KmsVerifier,
    issuer: RptIssuer,
    idempotency: IdempotencyStore,
    recon: Mutex<ReconEngine>,
    settlement: Mutex<SettlementLedger>,
    mirror: Option<PostgresMirror>,
    allowed_destinations: Option<Vec<String>>,
}

impl RemitEngine {
    /// Build the engine, connecting and hydrating the mirror when one is
    /// configured. KMS signing stays inside the issuer; everything else
    /// holds the verify-only handle.
    pub async fn bootstrap(
        config: EngineConfig,
        rail: Arc<dyn RailProvider>,
        kms: Arc<dyn KmsProvider>,
    ) -> Result<Self, RemitError> {
        let mirror = match &config.storage {
            StorageConfig::Memory => None,
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let mirror = PostgresMirror::connect(database_url, *max_connections).await?;
                mirror.ensure_schema().await?;
                Some(mirror)
            }
        };

        let mut recon = ReconEngine::new(config.statement);
        if let Some(mirror) = &mirror {
            for line in mirror.load_statement_lines().await? {
                recon.restore_line(line);
            }
        }

        info!(storage = config.storage.label(), "remit engine bootstrapped");

        Ok(Self {
            store: PeriodStore::new(),
            rail,
            verifier: KmsVerifier::new(kms.clone()),
            issuer: RptIssuer::new(kms, config.rpt_ttl),
            idempotency: IdempotencyStore::new(Duration::hours(24)),
            recon: Mutex::new(recon),
            settlement: Mutex::new(SettlementLedger::new()),
            mirror,
            allowed_destinations: config.allowed_destinations,
        })
    }

    /// Open a period for accrual. With a mirror configured, previously
    /// mirrored ledger entries are hydrated back and chain-verified.
    pub async fn open_period(
        &self,
        key: PeriodKey,
        thresholds: AnomalyThresholds,
    ) -> Result<Period, RemitError> {
        let mut period = Period::open(key.clone(), thresholds);
        let mut ledger = OwaLedger::new();

        if let Some(mirror) = &self.mirror {
            let hydrated = mirror.hydrate_ledger(&key).await?;
            if !hydrated.entries().is_empty() {
                period.credited_to_owa_cents = hydrated
                    .entries()
                    .iter()
                    .filter(|e| e.amount_cents > 0)
                    .map(|e| e.amount_cents)
                    .sum();
                period.running_balance_hash = hydrated.latest_hash();
                period.merkle_root = hydrated.merkle_root();
                ledger = hydrated;
            }
        }

        let snapshot = period.clone();
        let created = self
            .store
            .insert_cell_if_absent(PeriodCell {
                period,
                ledger,
                rpt: None,
            })
            .await;
        if !created {
            return Err(RemitError::Validation(format!(
                "period {key} already exists"
            )));
        }
        info!(period = %key, "period opened");
        Ok(snapshot)
    }

    /// Credit the period's OWA ledger from a settled deposit.
    pub async fn deposit(
        &self,
        key: &PeriodKey,
        amount_cents: i64,
        bank_receipt_id: &str,
    ) -> Result<LedgerEntry, RemitError> {
        let mut cell = self.store.lock(key).await?;
        // Deposits may land while a period is blocked (topping up the
        // OWA is the usual discrepancy remediation), but not once a
        // token is issued: the token binds the ledger hash at issuance.
        if matches!(
            cell.period.state,
            PeriodState::ReadyRpt | PeriodState::Released
        ) {
            return Err(invalid_state(&cell.period, "OPEN, CLOSING or BLOCKED_*"));
        }

        let entry = cell.ledger.build_deposit(amount_cents, bank_receipt_id)?;
        if let Some(mirror) = &self.mirror {
            mirror.insert_entry(key, &entry).await?;
        }
        cell.ledger.commit_entry(entry.clone())?;

        cell.period.credited_to_owa_cents += amount_cents;
        refresh_ledger_summaries(&mut cell);
        Ok(entry)
    }

    /// Close a period: `OPEN/CLOSING -> {BLOCKED_* | READY_RPT}`. On
    /// `READY_RPT` the release token is issued synchronously as part of
    /// the same transition.
    pub async fn close_period(
        &self,
        key: &PeriodKey,
        inputs: CloseInputs,
    ) -> Result<PeriodView, RemitError> {
        self.transition(key, inputs, false).await
    }

    /// Re-run the close evaluation for a blocked period after operator
    /// remediation. Blocked periods never re-evaluate automatically.
    pub async fn reevaluate(
        &self,
        key: &PeriodKey,
        inputs: CloseInputs,
    ) -> Result<PeriodView, RemitError> {
        self.transition(key, inputs, true).await
    }

    async fn transition(
        &self,
        key: &PeriodKey,
        inputs: CloseInputs,
        from_blocked: bool,
    ) -> Result<PeriodView, RemitError> {
        if inputs.final_liability_cents <= 0 {
            return Err(RemitError::Validation(format!(
                "final liability must be positive, got {}",
                inputs.final_liability_cents
            )));
        }

        let mut cell = self.store.lock(key).await?;
        let allowed = if from_blocked {
            cell.period.state.is_blocked()
        } else {
            matches!(cell.period.state, PeriodState::Open | PeriodState::Closing)
        };
        if !allowed {
            let expected = if from_blocked {
                "BLOCKED_ANOMALY or BLOCKED_DISCREPANCY"
            } else {
                "OPEN or CLOSING"
            };
            return Err(invalid_state(&cell.period, expected));
        }

        cell.period.state = PeriodState::Closing;
        cell.period.final_liability_cents = inputs.final_liability_cents;
        if let Some(accrued) = inputs.accrued_cents {
            cell.period.accrued_cents = accrued;
        }
        if let Some(vector) = inputs.anomaly_vector {
            cell.period.anomaly_vector = vector;
        }
        if let Some(rate_version) = inputs.rate_version {
            cell.period.rate_version = Some(rate_version);
        }
        refresh_ledger_summaries(&mut cell);

        match evaluate_transition(&cell.period) {
            TransitionDecision::Blocked(reason) => {
                cell.period.state = match &reason {
                    BlockReason::Anomaly { .. } => PeriodState::BlockedAnomaly,
                    BlockReason::Discrepancy { .. } => PeriodState::BlockedDiscrepancy,
                };
                warn!(period = %key, state = %cell.period.state, reason = ?reason, "period blocked");
                cell.period.block_reason = Some(reason);
                if let Some(token) = cell.rpt.as_mut() {
                    if token.status == RptStatus::Active {
                        token.status = RptStatus::Expired;
                    }
                }
            }
            TransitionDecision::Ready => {
                // Supersede rather than stack: at most one active token.
                if let Some(prev) = cell.rpt.as_mut() {
                    if prev.status == RptStatus::Active {
                        prev.status = RptStatus::Expired;
                    }
                }
                cell.period.block_reason = None;

                let reference = inputs
                    .reference
                    .unwrap_or_else(|| format!("RMT-{}-{}", key.abn, key.period_id));
                let token = self
                    .issuer
                    .issue(
                        &cell.period,
                        -cell.period.final_liability_cents,
                        inputs.rail.as_str(),
                        &reference,
                    )
                    .await?;
                info!(period = %key, digest = %token.payload_sha256, "release token issued");
                cell.rpt = Some(token);
                cell.period.state = PeriodState::ReadyRpt;
            }
        }

        cell.period.updated_at = Utc::now();
        Ok(PeriodView {
            period: cell.period.clone(),
            rpt: cell.rpt.clone(),
        })
    }

    /// Release the period's liability to the configured rail.
    ///
    /// The idempotency key (supplied or content-derived) is claimed
    /// first; concurrent callers with the same key block and then replay
    /// the finalized outcome, including failures.
    pub async fn release(&self, request: ReleaseRequest) -> Result<ReleaseOutcome, RemitError> {
        if request.amount_cents >= 0 {
            return Err(RemitError::Validation(format!(
                "release amount must be negative, got {}",
                request.amount_cents
            )));
        }
        let rail_kind = RailKind::parse(&request.rail).ok_or_else(|| {
            RemitError::Validation(format!("unknown rail '{}'", request.rail))
        })?;
        if request.destination.trim().is_empty() {
            return Err(RemitError::Validation("destination is required".to_string()));
        }
        if let Some(allowed) = &self.allowed_destinations {
            if !allowed.iter().any(|d| d == &request.destination) {
                return Err(RemitError::DestinationNotAllowed(
                    request.destination.clone(),
                ));
            }
        }

        let idem_key = request.idempotency_key.clone().unwrap_or_else(|| {
            IdempotencyStore::derive_key(
                &request.abn,
                request.tax_type.as_str(),
                &request.period_id,
                request.amount_cents,
            )
        });

        match self.idempotency.visit(&idem_key).await {
            KeyVisit::Replay(record) => Ok(ReleaseOutcome::Replayed(record)),
            KeyVisit::Execute(claim) => {
                match self.execute_release(&request, rail_kind, &idem_key).await {
                    Ok(response) => {
                        let body = serde_json::to_value(&response)
                            .map_err(|e| RemitError::Serialization(e.to_string()))?;
                        claim.applied(200, body);
                        Ok(ReleaseOutcome::Completed(response))
                    }
                    Err(err) => {
                        claim.failed(err.http_status(), json!({ "error": err.to_string() }));
                        Err(err)
                    }
                }
            }
        }
    }

    async fn execute_release(
        &self,
        request: &ReleaseRequest,
        rail_kind: RailKind,
        idem_key: &str,
    ) -> Result<ReleaseResponse, RemitError> {
        let period_key = request.key();
        let mut cell = self.store.lock(&period_key).await?;

        if cell.period.state != PeriodState::ReadyRpt {
            return Err(invalid_state(&cell.period, "READY_RPT"));
        }

        let (authorized_cents, reference, token_digest) = {
            let token = cell
                .rpt
                .as_ref()
                .ok_or_else(|| RemitError::RptRejected("no release token held".to_string()))?;
            let verification = verify_token(token, &self.verifier, Utc::now()).await?;
            if !verification.is_valid() {
                return Err(RemitError::RptRejected(format!(
                    "token failed verification: {verification:?}"
                )));
            }
            (
                token.payload.amount_cents,
                token.payload.reference.clone(),
                token.payload_sha256.clone(),
            )
        };

        if let Some(presented) = &request.rpt {
            if presented != &token_digest {
                return Err(RemitError::RptRejected(
                    "presented token digest does not match the active token".to_string(),
                ));
            }
        }
        if request.amount_cents != authorized_cents {
            return Err(RemitError::Validation(format!(
                "release amount {} differs from authorized amount {}",
                request.amount_cents, authorized_cents
            )));
        }

        let debit = request.amount_cents.abs();
        let balance = cell.ledger.latest_balance();
        if debit > balance {
            return Err(RemitError::InsufficientBalance {
                debit_cents: debit,
                balance_cents: balance,
            });
        }

        // The period lock stays held across the rail call by design:
        // this is the serialization point for the whole release
        // transaction. Other periods proceed independently.
        let rail_request = RailRequest {
            kind: rail_kind,
            amount_cents: debit,
            destination: request.destination.clone(),
            reference: reference.clone(),
            idempotency_key: idem_key.to_string(),
        };
        let receipt = self.rail.dispatch(&rail_request).await?;

        let entry = cell
            .ledger
            .build_release(request.amount_cents, &receipt.provider_reference)?;
        if let Some(mirror) = &self.mirror {
            mirror.insert_entry(&period_key, &entry).await?;
        }
        cell.ledger.commit_entry(entry.clone())?;

        // Token consumption is atomic with the ledger write: both happen
        // under the same period lock, with no separate step in between.
        if let Some(token) = cell.rpt.as_mut() {
            token.status = RptStatus::Consumed;
        }
        cell.period.state = PeriodState::Released;
        refresh_ledger_summaries(&mut cell);
        cell.period.updated_at = Utc::now();

        let release_uuid = Uuid::new_v4();
        let transfer_uuid = Uuid::new_v4();

        {
            let mut recon = self.recon.lock().await;
            recon.register_release(ReleaseRecord {
                release_uuid,
                bank_receipt_id: receipt.provider_reference.clone(),
                reference,
                amount_cents: debit,
                released_on: Utc::now().date_naive(),
                matched: false,
            });
        }
        {
            let (gst_cents, net_cents) = match period_key.tax_type {
                TaxType::Gst => (debit, 0),
                TaxType::Paygw => (0, debit),
            };
            let mut settlement = self.settlement.lock().await;
            settlement.register_release(
                receipt.provider_reference.clone(),
                ReleaseComponents {
                    gst_cents,
                    net_cents,
                },
            );
        }

        info!(
            period = %period_key,
            ledger_id = %entry.id,
            receipt = %receipt.provider_reference,
            synthetic = receipt.synthetic,
            balance_after = entry.balance_after_cents,
            "release completed"
        );

        Ok(ReleaseResponse {
            ok: true,
            ledger_id: entry.id,
            transfer_uuid,
            release_uuid,
            bank_receipt_id: receipt.provider_reference,
            balance_after_cents: entry.balance_after_cents,
            idempotency_key: idem_key.to_string(),
        })
    }

    /// Ingest a bank statement CSV and mirror the resulting lines.
    pub async fn ingest_statement<R: Read + Send>(
        &self,
        reader: R,
    ) -> Result<StatementIngestReport, RemitError> {
        let (report, lines) = {
            let mut recon = self.recon.lock().await;
            let report = recon.ingest_statement_csv(reader)?;
            let lines: Vec<BankStatementLine> = recon.lines().cloned().collect();
            (report, lines)
        };
        if let Some(mirror) = &self.mirror {
            for line in &lines {
                mirror.upsert_statement_line(line).await?;
            }
        }
        Ok(report)
    }

    /// Ingest a settlement webhook CSV and mirror applied components.
    pub async fn ingest_settlement<R: Read + Send>(
        &self,
        reader: R,
    ) -> Result<SettlementIngestReport, RemitError> {
        let report = {
            let mut settlement = self.settlement.lock().await;
            settlement.ingest_settlement_csv(reader)?
        };
        if let Some(mirror) = &self.mirror {
            for applied in &report.applied_components {
                mirror
                    .insert_settlement_component(
                        &applied.txn_id,
                        applied.component.as_str(),
                        applied.amount_cents,
                        applied.settlement_ts,
                    )
                    .await?;
            }
        }
        Ok(report)
    }

    pub async fn unresolved_lines(&self) -> Vec<BankStatementLine> {
        self.recon.lock().await.unresolved_lines()
    }

    pub async fn period(&self, key: &PeriodKey) -> Result<PeriodView, RemitError> {
        let cell = self.store.lock(key).await?;
        Ok(PeriodView {
            period: cell.period.clone(),
            rpt: cell.rpt.clone(),
        })
    }

    pub async fn ledger_entries(&self, key: &PeriodKey) -> Result<Vec<LedgerEntry>, RemitError> {
        let cell = self.store.lock(key).await?;
        Ok(cell.ledger.entries().to_vec())
    }

    /// Recompute the chain and Merkle root for evidence export.
    pub async fn ledger_proof(&self, key: &PeriodKey) -> Result<LedgerProof, RemitError> {
        let cell = self.store.lock(key).await?;
        let chain = cell.ledger.verify_chain();
        Ok(LedgerProof {
            entry_count: cell.ledger.entries().len(),
            balance_cents: cell.ledger.latest_balance(),
            latest_hash: cell.ledger.latest_hash(),
            merkle_root: cell.ledger.merkle_root(),
            chain_valid: chain.is_ok(),
            chain_error: chain.err(),
        })
    }
}

fn refresh_ledger_summaries(cell: &mut PeriodCell) {
    cell.period.running_balance_hash = cell.ledger.latest_hash();
    cell.period.merkle_root = cell.ledger.merkle_root();
}

fn invalid_state(period: &Period, expected: &str) -> RemitError {
    RemitError::InvalidPeriodState {
        period: period.key.to_string(),
        expected: expected.to_string(),
        actual: period.state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::sha256_hex;
    use crate::kms::LocalKms;
    use crate::rails::RailReceipt;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Deterministic in-process rail used by engine tests, mirroring the
    /// production mock's synthetic reference derivation.
    struct StaticRail {
        calls: AtomicU32,
        last_request: std::sync::Mutex<Option<RailRequest>>,
    }

    impl StaticRail {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                last_request: std::sync::Mutex::new(None),
            }
        }

        fn receipt(&self, request: &RailRequest) -> RailReceipt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            RailReceipt {
                provider_reference: format!(
                    "static-{}",
                    &sha256_hex(request.idempotency_key.as_bytes())[..16]
                ),
                raw: json!({"rail": request.kind.as_str()}),
                synthetic: true,
            }
        }
    }

    #[async_trait]
    impl RailProvider for StaticRail {
        fn rail_id(&self) -> &'static str {
            "static"
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

    struct RejectingRail;

    #[async_trait]
    impl RailProvider for RejectingRail {
        fn rail_id(&self) -> &'static str {
            "rejecting"
        }

        async fn eft(&self, _request: &RailRequest) -> Result<RailReceipt, RemitError> {
            Err(RemitError::RailRejected {
                message: "destination account closed".to_string(),
                upstream_status: Some(422),
            })
        }

        async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(request).await
        }

        async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(request).await
        }

        async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(request).await
        }
    }

    fn key() -> PeriodKey {
        PeriodKey::new("51824753556", TaxType::Gst, "2025-09")
    }

    async fn engine_with_rail(rail: Arc<dyn RailProvider>) -> RemitEngine {
        RemitEngine::bootstrap(
            EngineConfig::default(),
            rail,
            Arc::new(LocalKms::from_seed("engine-test-key", &[3u8; 32])),
        )
        .await
        .unwrap()
    }

    async fn ready_engine(rail: Arc<dyn RailProvider>) -> RemitEngine {
        let engine = engine_with_rail(rail).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();
        let view = engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();
        assert_eq!(view.period.state, PeriodState::ReadyRpt);
        engine
    }

    fn close_inputs(liability: i64) -> CloseInputs {
        CloseInputs {
            final_liability_cents: liability,
            accrued_cents: Some(liability),
            anomaly_vector: Some(AnomalyVector::default()),
            rate_version: Some("rates-2025.2".to_string()),
            rail: RailKind::Eft,
            reference: Some("INV-42".to_string()),
        }
    }

    fn release_request() -> ReleaseRequest {
        ReleaseRequest {
            abn: "51824753556".to_string(),
            tax_type: TaxType::Gst,
            period_id: "2025-09".to_string(),
            amount_cents: -150_000,
            destination: "ato-owa-gst".to_string(),
            rail: "eft".to_string(),
            idempotency_key: Some("rel-key-1".to_string()),
            rpt: None,
        }
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_released_with_verified_chain() {
        let rail = Arc::new(StaticRail::new());
        let engine = ready_engine(rail.clone()).await;

        let outcome = engine.release(release_request()).await.unwrap();
        let ReleaseOutcome::Completed(response) = outcome else {
            panic!("first release must execute");
        };
        assert!(response.ok);
        assert_eq!(response.balance_after_cents, 0);
        assert_eq!(response.idempotency_key, "rel-key-1");

        let view = engine.period(&key()).await.unwrap();
        assert_eq!(view.period.state, PeriodState::Released);
        assert_eq!(view.rpt.unwrap().status, RptStatus::Consumed);

        let proof = engine.ledger_proof(&key()).await.unwrap();
        assert!(proof.chain_valid);
        assert_eq!(proof.entry_count, 2);
        assert_eq!(proof.balance_cents, 0);
    }

    #[tokio::test]
    async fn release_before_close_is_a_state_conflict() {
        let engine = engine_with_rail(Arc::new(StaticRail::new())).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();

        let err = engine.release(release_request()).await.unwrap_err();
        assert!(matches!(err, RemitError::InvalidPeriodState { .. }));
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn second_release_with_same_key_replays_same_ledger_id() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;

        let ReleaseOutcome::Completed(first) = engine.release(release_request()).await.unwrap()
        else {
            panic!("first release must execute");
        };
        let ReleaseOutcome::Replayed(record) = engine.release(release_request()).await.unwrap()
        else {
            panic!("second release must replay");
        };
        assert_eq!(record.http_status, 200);
        assert_eq!(
            record.response_body.get("ledger_id").unwrap().as_str(),
            Some(first.ledger_id.to_string().as_str())
        );

        assert_eq!(engine.ledger_entries(&key()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_same_key_releases_produce_one_debit() {
        let rail = Arc::new(StaticRail::new());
        let engine = Arc::new(ready_engine(rail.clone()).await);

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.release(release_request()).await.unwrap() }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.release(release_request()).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let ledger_id_of = |outcome: &ReleaseOutcome| match outcome {
            ReleaseOutcome::Completed(resp) => resp.ledger_id.to_string(),
            ReleaseOutcome::Replayed(record) => record
                .response_body
                .get("ledger_id")
                .unwrap()
                .as_str()
                .unwrap()
                .to_string(),
        };
        assert_eq!(ledger_id_of(&a), ledger_id_of(&b));

        assert_eq!(rail.calls.load(Ordering::SeqCst), 1);
        let entries = engine.ledger_entries(&key()).await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.amount_cents < 0).count(), 1);
    }

    #[tokio::test]
    async fn failed_release_replays_the_original_failure() {
        let engine = ready_engine(Arc::new(RejectingRail)).await;

        let err = engine.release(release_request()).await.unwrap_err();
        assert!(matches!(err, RemitError::RailRejected { .. }));

        let ReleaseOutcome::Replayed(record) = engine.release(release_request()).await.unwrap()
        else {
            panic!("retry must replay the cached failure");
        };
        assert_eq!(record.http_status, 422);
        assert_eq!(record.status, crate::types::IdempotencyStatus::Failed);

        // The period is still releasable once the rail recovers.
        let view = engine.period(&key()).await.unwrap();
        assert_eq!(view.period.state, PeriodState::ReadyRpt);
        assert_eq!(engine.ledger_entries(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn anomaly_breach_blocks_and_records_reason() {
        let engine = engine_with_rail(Arc::new(StaticRail::new())).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();

        let mut inputs = close_inputs(150_000);
        inputs.anomaly_vector = Some(AnomalyVector {
            variance_ratio: 0.30,
            ..Default::default()
        });
        let view = engine.close_period(&key(), inputs).await.unwrap();
        assert_eq!(view.period.state, PeriodState::BlockedAnomaly);
        let Some(BlockReason::Anomaly { breaches }) = view.period.block_reason else {
            panic!("block reason must be recorded");
        };
        assert_eq!(breaches[0].metric, "variance_ratio");
    }

    #[tokio::test]
    async fn discrepancy_block_clears_after_remediation_and_reevaluation() {
        let engine = engine_with_rail(Arc::new(StaticRail::new())).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 100_000, "dep-1").await.unwrap();

        let view = engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();
        assert_eq!(view.period.state, PeriodState::BlockedDiscrepancy);

        // Blocked periods stay blocked until an explicit re-evaluation.
        let err = engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap_err();
        assert!(matches!(err, RemitError::InvalidPeriodState { .. }));

        engine.deposit(&key(), 50_000, "dep-2").await.unwrap();
        let view = engine
            .reevaluate(&key(), close_inputs(150_000))
            .await
            .unwrap();
        assert_eq!(view.period.state, PeriodState::ReadyRpt);
        assert!(view.period.block_reason.is_none());
    }

    #[tokio::test]
    async fn deposit_after_token_issuance_is_rejected() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        let err = engine.deposit(&key(), 50_000, "dep-late").await.unwrap_err();
        assert!(matches!(err, RemitError::InvalidPeriodState { .. }));
    }

    #[tokio::test]
    async fn reissue_supersedes_prior_token() {
        let engine = engine_with_rail(Arc::new(StaticRail::new())).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();

        let first = engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();
        let first_digest = first.rpt.unwrap().payload_sha256;

        let second = engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();
        let second_token = second.rpt.unwrap();
        assert_eq!(second_token.status, RptStatus::Active);
        assert_ne!(second_token.payload_sha256, first_digest);
    }

    #[tokio::test]
    async fn expired_token_rejects_release() {
        let config = EngineConfig {
            rpt_ttl: Duration::seconds(-1),
            ..Default::default()
        };
        let engine = RemitEngine::bootstrap(
            config,
            Arc::new(StaticRail::new()),
            Arc::new(LocalKms::from_seed("engine-test-key", &[3u8; 32])),
        )
        .await
        .unwrap();
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();
        engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();

        let err = engine.release(release_request()).await.unwrap_err();
        assert!(matches!(err, RemitError::RptRejected(_)));
    }

    #[tokio::test]
    async fn mismatched_presented_digest_is_rejected() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        let mut request = release_request();
        request.rpt = Some("deadbeef".to_string());
        let err = engine.release(request).await.unwrap_err();
        assert!(matches!(err, RemitError::RptRejected(_)));
    }

    #[tokio::test]
    async fn amount_mismatch_with_token_is_rejected() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        let mut request = release_request();
        request.amount_cents = -140_000;
        request.idempotency_key = Some("other-key".to_string());
        let err = engine.release(request).await.unwrap_err();
        assert!(matches!(err, RemitError::Validation(_)));
    }

    #[tokio::test]
    async fn positive_amount_is_rejected_before_idempotency() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        let mut request = release_request();
        request.amount_cents = 150_000;
        let err = engine.release(request).await.unwrap_err();
        assert!(matches!(err, RemitError::Validation(_)));
    }

    #[tokio::test]
    async fn destination_allow_list_is_enforced() {
        let config = EngineConfig {
            allowed_destinations: Some(vec!["ato-owa-gst".to_string()]),
            ..Default::default()
        };
        let engine = RemitEngine::bootstrap(
            config,
            Arc::new(StaticRail::new()),
            Arc::new(LocalKms::from_seed("engine-test-key", &[3u8; 32])),
        )
        .await
        .unwrap();
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        engine.deposit(&key(), 150_000, "dep-1").await.unwrap();
        engine
            .close_period(&key(), close_inputs(150_000))
            .await
            .unwrap();

        let mut request = release_request();
        request.destination = "unknown-account".to_string();
        let err = engine.release(request).await.unwrap_err();
        assert!(matches!(err, RemitError::DestinationNotAllowed(_)));
        assert_eq!(err.http_status(), 403);

        let ReleaseOutcome::Completed(_) = engine.release(release_request()).await.unwrap() else {
            panic!("allow-listed destination must release");
        };
    }

    #[tokio::test]
    async fn rail_receives_reference_and_idempotency_key() {
        let rail = Arc::new(StaticRail::new());
        let engine = ready_engine(rail.clone()).await;
        engine.release(release_request()).await.unwrap();

        let seen = rail.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.kind, RailKind::Eft);
        assert_eq!(seen.amount_cents, 150_000);
        assert_eq!(seen.reference, "INV-42");
        assert_eq!(seen.idempotency_key, "rel-key-1");
    }

    #[tokio::test]
    async fn released_funds_reconcile_by_reference() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        engine.release(release_request()).await.unwrap();

        let today = Utc::now().date_naive().format("%Y-%m-%d");
        let csv = format!(
            "bank_txn_id,reference,amount,date\nB1,INV-42,150000,{today}\n"
        );
        let report = engine.ingest_statement(csv.as_bytes()).await.unwrap();
        assert_eq!(report.matched, 1);
        assert!(engine.unresolved_lines().await.is_empty());
    }

    #[tokio::test]
    async fn settlement_caps_follow_the_released_component() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;
        let ReleaseOutcome::Completed(response) = engine.release(release_request()).await.unwrap()
        else {
            panic!("release must execute");
        };

        let csv = format!(
            "txn_id,gst_cents,net_cents,settlement_ts\n\
             {rcpt},150000,0,2025-10-06T10:00:00\n\
             {rcpt},1,0,2025-10-06T11:00:00\n",
            rcpt = response.bank_receipt_id
        );
        let report = engine.ingest_settlement(csv.as_bytes()).await.unwrap();
        assert_eq!(report.applied_rows, 1);
        assert_eq!(report.rejected_rows, 1);
    }

    #[tokio::test]
    async fn derived_key_collapses_organic_retries() {
        let engine = ready_engine(Arc::new(StaticRail::new())).await;

        let mut request = release_request();
        request.idempotency_key = None;
        let ReleaseOutcome::Completed(first) = engine.release(request.clone()).await.unwrap()
        else {
            panic!("first release must execute");
        };
        assert_eq!(
            first.idempotency_key,
            IdempotencyStore::derive_key("51824753556", "GST", "2025-09", -150_000)
        );

        let ReleaseOutcome::Replayed(_) = engine.release(request).await.unwrap() else {
            panic!("organic retry must replay");
        };
    }

    #[tokio::test]
    async fn open_period_twice_is_rejected() {
        let engine = engine_with_rail(Arc::new(StaticRail::new())).await;
        engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap();
        let err = engine
            .open_period(key(), AnomalyThresholds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemitError::Validation(_)));
    }
}
