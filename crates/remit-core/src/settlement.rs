//! Settlement webhook ingestion.
//!
//! Each row settles GST/NET cents against a release. Negative rows are
//! reversals. Duplicates are counted but never re-applied, and a row
//! that would push any component past its originating release amount is
//! rejected whole with `OVER_SETTLEMENT`.

use crate::error::RemitError;
use crate::types::SettlementComponent;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;

/// Component caps from the originating release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReleaseComponents {
    pub gst_cents: i64,
    pub net_cents: i64,
}

impl ReleaseComponents {
    fn cap(&self, component: SettlementComponent) -> i64 {
        match component {
            SettlementComponent::Gst => self.gst_cents,
            SettlementComponent::Net => self.net_cents,
        }
    }
}

/// One parsed settlement row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRow {
    pub txn_id: String,
    pub gst_cents: i64,
    pub net_cents: i64,
    pub settlement_ts: DateTime<Utc>,
}

/// One freshly applied component, surfaced so callers can mirror it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedComponent {
    pub txn_id: String,
    pub component: SettlementComponent,
    pub amount_cents: i64,
    pub settlement_ts: DateTime<Utc>,
}

/// Summary of one settlement ingestion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementIngestReport {
    pub applied_rows: usize,
    pub duplicate_components: usize,
    pub rejected_rows: usize,
    pub skipped_rows: usize,
    pub unknown_txn_rows: usize,
    #[serde(skip)]
    pub applied_components: Vec<AppliedComponent>,
}

#[derive(Debug, Deserialize)]
struct SettlementCsvRow {
    txn_id: String,
    gst_cents: i64,
    net_cents: i64,
    settlement_ts: String,
}

/// Per-(txn, component) settlement accumulators.
pub struct SettlementLedger {
    releases: HashMap<String, ReleaseComponents>,
    settled: HashMap<(String, SettlementComponent), i64>,
    seen: HashSet<(String, SettlementComponent, i64, DateTime<Utc>)>,
    duplicate_count: u64,
}

impl SettlementLedger {
    pub fn new() -> Self {
        Self {
            releases: HashMap::new(),
            settled: HashMap::new(),
            seen: HashSet::new(),
            duplicate_count: 0,
        }
    }

    /// Register the component caps for a release transaction id.
    pub fn register_release(&mut self, txn_id: impl Into<String>, components: ReleaseComponents) {
        self.releases.insert(txn_id.into(), components);
    }

    pub fn settled_cents(&self, txn_id: &str, component: SettlementComponent) -> i64 {
        self.settled
            .get(&(txn_id.to_string(), component))
            .copied()
            .unwrap_or(0)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count
    }

    /// Apply one row all-or-nothing. Component entries already seen are
    /// counted as duplicates and excluded; if any remaining component
    /// would exceed its cap, the whole row is rejected and nothing —
    /// including duplicate bookkeeping for its fresh components — is
    /// recorded.
    pub fn apply_row(&mut self, row: &SettlementRow) -> Result<Vec<AppliedComponent>, RemitError> {
        let release = self.releases.get(&row.txn_id).ok_or_else(|| {
            RemitError::NotFound(format!("no release registered for txn '{}'", row.txn_id))
        })?;
        let release = *release;

        let components = [
            (SettlementComponent::Gst, row.gst_cents),
            (SettlementComponent::Net, row.net_cents),
        ];

        let mut fresh: Vec<(SettlementComponent, i64)> = Vec::new();
        let mut duplicates = 0_u64;
        for (component, amount_cents) in components {
            if amount_cents == 0 {
                continue;
            }
            let fingerprint = (
                row.txn_id.clone(),
                component,
                amount_cents,
                row.settlement_ts,
            );
            if self.seen.contains(&fingerprint) {
                duplicates += 1;
            } else {
                fresh.push((component, amount_cents));
            }
        }

        // Validate every fresh component before mutating anything.
        for (component, amount_cents) in &fresh {
            let cap = release.cap(*component).abs();
            let current = self.settled_cents(&row.txn_id, *component);
            let next = current + amount_cents;
            if next.abs() > cap {
                return Err(RemitError::OverSettlement {
                    txn_id: row.txn_id.clone(),
                    component: component.as_str().to_string(),
                    attempted_cents: next,
                    cap_cents: cap,
                });
            }
        }

        self.duplicate_count += duplicates;
        let mut applied = Vec::with_capacity(fresh.len());
        for (component, amount_cents) in fresh {
            *self
                .settled
                .entry((row.txn_id.clone(), component))
                .or_insert(0) += amount_cents;
            self.seen.insert((
                row.txn_id.clone(),
                component,
                amount_cents,
                row.settlement_ts,
            ));
            applied.push(AppliedComponent {
                txn_id: row.txn_id.clone(),
                component,
                amount_cents,
                settlement_ts: row.settlement_ts,
            });
        }
        Ok(applied)
    }

    /// Ingest a settlement CSV: header then
    /// `txn_id,gst_cents,net_cents,settlement_ts`.
    pub fn ingest_settlement_csv<R: Read>(
        &mut self,
        reader: R,
    ) -> Result<SettlementIngestReport, RemitError> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let mut report = SettlementIngestReport::default();

        for row in csv_reader.deserialize::<SettlementCsvRow>() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed settlement row");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            let settlement_ts = match parse_settlement_ts(&row.settlement_ts) {
                Ok(ts) => ts,
                Err(err) => {
                    tracing::warn!(txn_id = %row.txn_id, error = %err, "skipping row with bad timestamp");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            let parsed = SettlementRow {
                txn_id: row.txn_id.trim().to_string(),
                gst_cents: row.gst_cents,
                net_cents: row.net_cents,
                settlement_ts,
            };

            let before = self.duplicate_count;
            match self.apply_row(&parsed) {
                Ok(applied) => {
                    report.duplicate_components += (self.duplicate_count - before) as usize;
                    if !applied.is_empty() {
                        report.applied_rows += 1;
                        report.applied_components.extend(applied);
                    }
                }
                Err(RemitError::OverSettlement { txn_id, component, .. }) => {
                    tracing::warn!(txn_id = %txn_id, component = %component, "settlement row rejected: over-settlement");
                    report.rejected_rows += 1;
                }
                Err(RemitError::NotFound(_)) => {
                    tracing::warn!(txn_id = %parsed.txn_id, "settlement row references unknown release");
                    report.unknown_txn_rows += 1;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }
}

impl Default for SettlementLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_settlement_ts(raw: &str) -> Result<DateTime<Utc>, RemitError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::default()).and_utc());
    }
    Err(RemitError::Validation(format!(
        "unparseable settlement timestamp '{raw}'"
    )))
}
