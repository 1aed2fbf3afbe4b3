//! Bank statement reconciliation.
//!
//! Statement CSVs are upserted by `bank_txn_id` and matched against
//! registered releases: exact reference match first, then a fuzzy window
//! of one cent and two days. Re-ingesting a file is a no-op on lines
//! that already matched.

use crate::error::RemitError;
use crate::types::{BankStatementLine, LineStatus, MatchStrategy, ReleaseRecord};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use uuid::Uuid;

/// Fuzzy match tolerances.
const FUZZY_AMOUNT_TOLERANCE_CENTS: i64 = 1;
const FUZZY_DATE_TOLERANCE_DAYS: i64 = 2;

/// Posting-date adjustment rules for incoming statement lines.
#[derive(Debug, Clone, Copy)]
pub struct StatementConfig {
    /// Lines timestamped at or after this hour post the next day.
    pub cutoff_hour: u32,
    /// Saturday posts +2 days, Sunday +1, landing both on Monday.
    pub weekend_adjust: bool,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            cutoff_hour: 17,
            weekend_adjust: true,
        }
    }
}

/// Summary of one statement ingestion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementIngestReport {
    pub ingested: usize,
    pub matched: usize,
    pub previously_matched: usize,
    pub unresolved: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Deserialize)]
struct StatementCsvRow {
    bank_txn_id: String,
    reference: String,
    amount: String,
    date: String,
}

/// Matches bank-feed lines to registered releases.
pub struct ReconEngine {
    config: StatementConfig,
    lines: HashMap<String, BankStatementLine>,
    releases: HashMap<Uuid, ReleaseRecord>,
}

impl ReconEngine {
    pub fn new(config: StatementConfig) -> Self {
        Self {
            config,
            lines: HashMap::new(),
            releases: HashMap::new(),
        }
    }

    /// Register a release as a match candidate. Called by the release
    /// transaction after the ledger debit commits.
    pub fn register_release(&mut self, release: ReleaseRecord) {
        self.releases.insert(release.release_uuid, release);
    }

    /// Rehydrate previously persisted lines (mirror bootstrap).
    pub fn restore_line(&mut self, line: BankStatementLine) {
        self.lines.insert(line.bank_txn_id.clone(), line);
    }

    pub fn line(&self, bank_txn_id: &str) -> Option<&BankStatementLine> {
        self.lines.get(bank_txn_id)
    }

    pub fn release(&self, release_uuid: &Uuid) -> Option<&ReleaseRecord> {
        self.releases.get(release_uuid)
    }

    /// Unresolved lines for manual review, ordered by date then id.
    pub fn unresolved_lines(&self) -> Vec<BankStatementLine> {
        let mut lines: Vec<BankStatementLine> = self
            .lines
            .values()
            .filter(|line| line.status == LineStatus::Unresolved)
            .cloned()
            .collect();
        lines.sort_by(|a, b| {
            a.statement_date
                .cmp(&b.statement_date)
                .then_with(|| a.bank_txn_id.cmp(&b.bank_txn_id))
        });
        lines
    }

    /// Parse and ingest a statement CSV: header row then
    /// `bank_txn_id,reference,amount,date`. Rows that fail to parse are
    /// counted and skipped rather than aborting the file.
    pub fn ingest_statement_csv<R: Read>(
        &mut self,
        reader: R,
    ) -> Result<StatementIngestReport, RemitError> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let mut report = StatementIngestReport::default();

        for row in csv_reader.deserialize::<StatementCsvRow>() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed statement row");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            let amount_cents = match parse_amount_cents(&row.amount) {
                Ok(cents) => cents,
                Err(err) => {
                    tracing::warn!(bank_txn_id = %row.bank_txn_id, error = %err, "skipping row with bad amount");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            let statement_date = match parse_statement_timestamp(&row.date) {
                Ok(ts) => adjust_statement_date(ts, &self.config),
                Err(err) => {
                    tracing::warn!(bank_txn_id = %row.bank_txn_id, error = %err, "skipping row with bad date");
                    report.skipped_rows += 1;
                    continue;
                }
            };

            report.ingested += 1;
            let strategy = self.upsert_and_match(
                row.bank_txn_id.trim().to_string(),
                row.reference.trim().to_string(),
                amount_cents,
                statement_date,
            );
            match strategy {
                Some(MatchStrategy::Previous) => report.previously_matched += 1,
                Some(_) => report.matched += 1,
                None => report.unresolved += 1,
            }
        }

        Ok(report)
    }

    /// Upsert one line by `bank_txn_id` and attempt the match cascade.
    /// First hit wins: PREVIOUS short-circuit, exact REFERENCE, FUZZY.
    pub fn upsert_and_match(
        &mut self,
        bank_txn_id: String,
        reference: String,
        amount_cents: i64,
        statement_date: NaiveDate,
    ) -> Option<MatchStrategy> {
        if let Some(existing) = self.lines.get_mut(&bank_txn_id) {
            if existing.matched_release_uuid.is_some() {
                existing.match_strategy = Some(MatchStrategy::Previous);
                return Some(MatchStrategy::Previous);
            }
            existing.reference = reference;
            existing.amount_cents = amount_cents;
            existing.statement_date = statement_date;
        } else {
            self.lines.insert(
                bank_txn_id.clone(),
                BankStatementLine {
                    bank_txn_id: bank_txn_id.clone(),
                    amount_cents,
                    reference,
                    statement_date,
                    status: LineStatus::Unresolved,
                    matched_release_uuid: None,
                    match_strategy: None,
                },
            );
        }

        let matched = self.find_match(&bank_txn_id);
        if let Some((release_uuid, strategy)) = matched {
            let line = self.lines.get_mut(&bank_txn_id).expect("line upserted");
            line.status = LineStatus::Matched;
            line.matched_release_uuid = Some(release_uuid);
            line.match_strategy = Some(strategy);
            self.releases
                .get_mut(&release_uuid)
                .expect("release exists")
                .matched = true;
            Some(strategy)
        } else {
            None
        }
    }

    fn find_match(&self, bank_txn_id: &str) -> Option<(Uuid, MatchStrategy)> {
        let line = self.lines.get(bank_txn_id)?;

        // Deterministic candidate order regardless of map iteration.
        let mut candidates: Vec<&ReleaseRecord> =
            self.releases.values().filter(|r| !r.matched).collect();
        candidates.sort_by(|a, b| {
            a.released_on
                .cmp(&b.released_on)
                .then_with(|| a.release_uuid.cmp(&b.release_uuid))
        });

        for release in &candidates {
            if release.reference == line.reference && release.amount_cents == line.amount_cents {
                return Some((release.release_uuid, MatchStrategy::Reference));
            }
        }

        for release in &candidates {
            let amount_diff = (release.amount_cents - line.amount_cents).abs();
            let day_diff = (line.statement_date - release.released_on).num_days().abs();
            if amount_diff <= FUZZY_AMOUNT_TOLERANCE_CENTS
                && day_diff <= FUZZY_DATE_TOLERANCE_DAYS
            {
                return Some((release.release_uuid, MatchStrategy::Fuzzy));
            }
        }

        None
    }

    pub fn lines(&self) -> impl Iterator<Item = &BankStatementLine> {
        self.lines.values()
    }
}

/// Parse a statement amount into cents. Accepts `$`/`,`-decorated input;
/// values carrying a decimal point are dollars, bare integers are already
/// cents.
pub fn parse_amount_cents(raw: &str) -> Result<i64, RemitError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return Err(RemitError::Validation("empty amount".to_string()));
    }

    match cleaned.split_once('.') {
        None => cleaned
            .parse::<i64>()
            .map_err(|e| RemitError::Validation(format!("bad amount '{raw}': {e}"))),
        Some((dollars, fraction)) => {
            if fraction.len() > 2 || fraction.chars().any(|c| !c.is_ascii_digit()) {
                return Err(RemitError::Validation(format!(
                    "amount '{raw}' has sub-cent precision"
                )));
            }
            let negative = dollars.starts_with('-');
            let whole: i64 = dollars
                .parse()
                .map_err(|e| RemitError::Validation(format!("bad amount '{raw}': {e}")))?;
            let cents: i64 = format!("{fraction:0<2}")
                .parse()
                .map_err(|e| RemitError::Validation(format!("bad amount '{raw}': {e}")))?;
            let magnitude = whole.abs() * 100 + cents;
            Ok(if negative { -magnitude } else { magnitude })
        }
    }
}

/// Parse a statement date, with or without a time component.
pub fn parse_statement_timestamp(raw: &str) -> Result<NaiveDateTime, RemitError> {
    let raw = raw.trim();
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(date.and_time(NaiveTime::default()));
        }
    }
    Err(RemitError::Validation(format!("unparseable date '{raw}'")))
}

/// Cutoff and weekend posting rules: at/after the cutoff hour a line
/// posts the next day; weekend postings roll forward to Monday.
pub fn adjust_statement_date(ts: NaiveDateTime, config: &StatementConfig) -> NaiveDate {
    let mut date = ts.date();
    if ts.time().hour() >= config.cutoff_hour {
        date = date.succ_opt().expect("date in range");
    }
    if config.weekend_adjust {
        date = match date.weekday() {
            Weekday::Sat => date + chrono::Days::new(2),
            Weekday::Sun => date + chrono::Days::new(1),
            _ => date,
        };
    }
    date
}
