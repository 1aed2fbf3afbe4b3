//! Persistence for periods, ledger entries, and reconciliation state.
//!
//! The in-process store is authoritative at runtime. When PostgreSQL is
//! configured, every ledger append is mirrored before the in-memory
//! commit, and bootstrap hydrates mirrored entries back with full
//! hash-chain verification. Each period owns its own async lock; that
//! lock is the serialization point for appends, RPT issuance and
//! consumption, so unrelated periods never contend.

use crate::error::RemitError;
use crate::ledger::OwaLedger;
use crate::types::{BankStatementLine, LedgerEntry, LineStatus, MatchStrategy, Period, PeriodKey, RptToken};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// Persistence backend selection.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep all state in process memory only.
    Memory,
    /// Mirror ledger and reconciliation rows in PostgreSQL and hydrate
    /// on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Mutable state guarded by one period's lock.
#[derive(Debug)]
pub struct PeriodCell {
    pub period: Period,
    pub ledger: OwaLedger,
    pub rpt: Option<RptToken>,
}

/// All periods, each behind its own lock. The outer map lock is held
/// only long enough to clone the slot `Arc`, never across I/O.
#[derive(Clone, Default)]
pub struct PeriodStore {
    slots: Arc<RwLock<HashMap<PeriodKey, Arc<Mutex<PeriodCell>>>>>,
}

impl PeriodStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh period if absent; returns whether it was created.
    pub async fn insert_if_absent(&self, period: Period) -> bool {
        self.insert_cell_if_absent(PeriodCell {
            period,
            ledger: OwaLedger::new(),
            rpt: None,
        })
        .await
    }

    /// Insert a pre-built cell (e.g. hydrated from the mirror) if absent.
    pub async fn insert_cell_if_absent(&self, cell: PeriodCell) -> bool {
        let mut slots = self.slots.write().await;
        match slots.entry(cell.period.key.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(cell)));
                true
            }
        }
    }

    /// Restore a hydrated cell wholesale (bootstrap only).
    pub async fn restore(&self, cell: PeriodCell) {
        let mut slots = self.slots.write().await;
        slots.insert(cell.period.key.clone(), Arc::new(Mutex::new(cell)));
    }

    /// Acquire the period's row lock. Holding the returned guard is what
    /// serializes conflicting operations on the same period.
    pub async fn lock(&self, key: &PeriodKey) -> Result<OwnedMutexGuard<PeriodCell>, RemitError> {
        let slot = {
            let slots = self.slots.read().await;
            slots
                .get(key)
                .cloned()
                .ok_or_else(|| RemitError::NotFound(format!("period {key}")))?
        };
        Ok(slot.lock_owned().await)
    }

    pub async fn contains(&self, key: &PeriodKey) -> bool {
        self.slots.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<PeriodKey> {
        self.slots.read().await.keys().cloned().collect()
    }
}

/// PostgreSQL mirror for durable audit rows.
#[derive(Debug, Clone)]
pub struct PostgresMirror {
    pool: PgPool,
}

impl PostgresMirror {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RemitError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| RemitError::Storage(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), RemitError> {
        // Append-only ledger rows; the application owns seq/hash generation.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS owa_ledger_entries (
                abn TEXT NOT NULL,
                tax_type TEXT NOT NULL,
                period_id TEXT NOT NULL,
                seq BIGINT NOT NULL,
                entry_id TEXT NOT NULL UNIQUE,
                amount_cents BIGINT NOT NULL,
                balance_after_cents BIGINT NOT NULL,
                bank_receipt_id TEXT NOT NULL,
                bank_receipt_hash TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash_after TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (abn, tax_type, period_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bank_statement_lines (
                bank_txn_id TEXT PRIMARY KEY,
                amount_cents BIGINT NOT NULL,
                reference TEXT NOT NULL,
                statement_date DATE NOT NULL,
                status TEXT NOT NULL,
                matched_release_uuid TEXT NULL,
                match_strategy TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_components (
                txn_id TEXT NOT NULL,
                component TEXT NOT NULL,
                amount_cents BIGINT NOT NULL,
                settlement_ts TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_owa_ledger_period ON owa_ledger_entries (abn, tax_type, period_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    /// Mirror one ledger entry. Runs before the in-memory commit so a
    /// write failure never leaves memory ahead of the mirror.
    pub async fn insert_entry(&self, key: &PeriodKey, entry: &LedgerEntry) -> Result<(), RemitError> {
        let seq: i64 = entry
            .seq
            .try_into()
            .map_err(|_| RemitError::Storage("ledger seq exceeds BIGINT range".to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO owa_ledger_entries (
                abn, tax_type, period_id, seq, entry_id, amount_cents,
                balance_after_cents, bank_receipt_id, bank_receipt_hash,
                prev_hash, hash_after, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&key.abn)
        .bind(key.tax_type.as_str())
        .bind(&key.period_id)
        .bind(seq)
        .bind(entry.id.to_string())
        .bind(entry.amount_cents)
        .bind(entry.balance_after_cents)
        .bind(&entry.bank_receipt_id)
        .bind(&entry.bank_receipt_hash)
        .bind(&entry.prev_hash)
        .bind(&entry.hash_after)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres ledger insert failed: {e}")))?;
        Ok(())
    }

    pub async fn load_entries(&self, key: &PeriodKey) -> Result<Vec<LedgerEntry>, RemitError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, entry_id, amount_cents, balance_after_cents,
                   bank_receipt_id, bank_receipt_hash, prev_hash, hash_after,
                   recorded_at
            FROM owa_ledger_entries
            WHERE abn = $1 AND tax_type = $2 AND period_id = $3
            ORDER BY seq ASC
            "#,
        )
        .bind(&key.abn)
        .bind(key.tax_type.as_str())
        .bind(&key.period_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres ledger load failed: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row
                .try_get("seq")
                .map_err(|e| RemitError::Storage(format!("postgres decode seq failed: {e}")))?;
            let entry_id: String = row
                .try_get("entry_id")
                .map_err(|e| RemitError::Storage(format!("postgres decode entry_id failed: {e}")))?;
            entries.push(LedgerEntry {
                id: Uuid::parse_str(&entry_id)
                    .map_err(|e| RemitError::Storage(format!("bad entry_id in storage: {e}")))?,
                seq: seq
                    .try_into()
                    .map_err(|_| RemitError::Storage("negative seq in storage".to_string()))?,
                amount_cents: row
                    .try_get("amount_cents")
                    .map_err(|e| RemitError::Storage(format!("postgres decode amount failed: {e}")))?,
                balance_after_cents: row.try_get("balance_after_cents").map_err(|e| {
                    RemitError::Storage(format!("postgres decode balance failed: {e}"))
                })?,
                bank_receipt_id: row.try_get("bank_receipt_id").map_err(|e| {
                    RemitError::Storage(format!("postgres decode receipt id failed: {e}"))
                })?,
                bank_receipt_hash: row.try_get("bank_receipt_hash").map_err(|e| {
                    RemitError::Storage(format!("postgres decode receipt hash failed: {e}"))
                })?,
                prev_hash: row
                    .try_get("prev_hash")
                    .map_err(|e| RemitError::Storage(format!("postgres decode prev_hash failed: {e}")))?,
                hash_after: row
                    .try_get("hash_after")
                    .map_err(|e| RemitError::Storage(format!("postgres decode hash_after failed: {e}")))?,
                recorded_at: row.try_get("recorded_at").map_err(|e| {
                    RemitError::Storage(format!("postgres decode recorded_at failed: {e}"))
                })?,
            });
        }
        Ok(entries)
    }

    /// Load entries and rebuild the verified chain for one period.
    pub async fn hydrate_ledger(&self, key: &PeriodKey) -> Result<OwaLedger, RemitError> {
        let entries = self.load_entries(key).await?;
        OwaLedger::from_entries(entries)
    }

    /// Upsert one statement line by its natural external key.
    pub async fn upsert_statement_line(&self, line: &BankStatementLine) -> Result<(), RemitError> {
        sqlx::query(
            r#"
            INSERT INTO bank_statement_lines (
                bank_txn_id, amount_cents, reference, statement_date,
                status, matched_release_uuid, match_strategy
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (bank_txn_id) DO UPDATE SET
                amount_cents = EXCLUDED.amount_cents,
                reference = EXCLUDED.reference,
                statement_date = EXCLUDED.statement_date,
                status = EXCLUDED.status,
                matched_release_uuid = EXCLUDED.matched_release_uuid,
                match_strategy = EXCLUDED.match_strategy
            "#,
        )
        .bind(&line.bank_txn_id)
        .bind(line.amount_cents)
        .bind(&line.reference)
        .bind(line.statement_date)
        .bind(match line.status {
            LineStatus::Unresolved => "UNRESOLVED",
            LineStatus::Matched => "MATCHED",
        })
        .bind(line.matched_release_uuid.map(|u| u.to_string()))
        .bind(line.match_strategy.map(|s| s.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres statement upsert failed: {e}")))?;
        Ok(())
    }

    pub async fn load_statement_lines(&self) -> Result<Vec<BankStatementLine>, RemitError> {
        let rows = sqlx::query(
            r#"
            SELECT bank_txn_id, amount_cents, reference, statement_date,
                   status, matched_release_uuid, match_strategy
            FROM bank_statement_lines
            ORDER BY statement_date ASC, bank_txn_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres statement load failed: {e}")))?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| RemitError::Storage(format!("postgres decode status failed: {e}")))?;
            let strategy: Option<String> = row.try_get("match_strategy").map_err(|e| {
                RemitError::Storage(format!("postgres decode strategy failed: {e}"))
            })?;
            let matched_release_raw: Option<String> =
                row.try_get("matched_release_uuid").map_err(|e| {
                    RemitError::Storage(format!("postgres decode release uuid failed: {e}"))
                })?;
            let matched_release_uuid = matched_release_raw
                .map(|raw| {
                    Uuid::parse_str(&raw).map_err(|e| {
                        RemitError::Storage(format!("bad release uuid in storage: {e}"))
                    })
                })
                .transpose()?;
            lines.push(BankStatementLine {
                bank_txn_id: row.try_get("bank_txn_id").map_err(|e| {
                    RemitError::Storage(format!("postgres decode bank_txn_id failed: {e}"))
                })?,
                amount_cents: row.try_get("amount_cents").map_err(|e| {
                    RemitError::Storage(format!("postgres decode amount failed: {e}"))
                })?,
                reference: row.try_get("reference").map_err(|e| {
                    RemitError::Storage(format!("postgres decode reference failed: {e}"))
                })?,
                statement_date: row.try_get("statement_date").map_err(|e| {
                    RemitError::Storage(format!("postgres decode date failed: {e}"))
                })?,
                status: parse_line_status(&status)?,
                matched_release_uuid,
                match_strategy: strategy.as_deref().map(parse_strategy).transpose()?,
            });
        }
        Ok(lines)
    }

    /// Append one settlement component application.
    pub async fn insert_settlement_component(
        &self,
        txn_id: &str,
        component: &str,
        amount_cents: i64,
        settlement_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), RemitError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_components (txn_id, component, amount_cents, settlement_ts)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(txn_id)
        .bind(component)
        .bind(amount_cents)
        .bind(settlement_ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RemitError::Storage(format!("postgres settlement insert failed: {e}")))?;
        Ok(())
    }
}

fn parse_line_status(value: &str) -> Result<LineStatus, RemitError> {
    match value {
        "UNRESOLVED" => Ok(LineStatus::Unresolved),
        "MATCHED" => Ok(LineStatus::Matched),
        other => Err(RemitError::Storage(format!(
            "unknown statement status '{other}' in postgres"
        ))),
    }
}

fn parse_strategy(value: &str) -> Result<MatchStrategy, RemitError> {
    match value {
        "PREVIOUS" => Ok(MatchStrategy::Previous),
        "REFERENCE" => Ok(MatchStrategy::Reference),
        "FUZZY" => Ok(MatchStrategy::Fuzzy),
        other => Err(RemitError::Storage(format!(
            "unknown match strategy '{other}' in postgres"
        ))),
    }
}
