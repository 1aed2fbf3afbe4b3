//! Idempotency key discipline for state-mutating calls.
//!
//! Each key owns an async lock. The first caller inserts a `pending`
//! record and executes while holding the lock; concurrent callers with
//! the same key block on that lock instead of double-executing, then see
//! the finalized record and replay it verbatim. A `failed` record
//! replays the original failure; it is never re-attempted within TTL.

use crate::canonical::sha256_hex;
use crate::types::{IdempotencyRecord, IdempotencyStatus};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone)]
pub struct IdempotencyStore {
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<IdempotencyRecord>>>>>,
    ttl: Duration,
}

/// Exclusive claim on a key. Holding this guard is what serializes
/// same-key callers; drop without finalizing leaves the record pending
/// for the next caller to claim.
pub struct IdempotencyClaim {
    guard: OwnedMutexGuard<IdempotencyRecord>,
}

/// Result of visiting a key: either a cached outcome to replay, or a
/// claim obligating the caller to execute and finalize.
pub enum KeyVisit {
    Replay(IdempotencyRecord),
    Execute(IdempotencyClaim),
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Derive a stable key from request content so organic retries that
    /// omit a key still collapse onto one record.
    pub fn derive_key(abn: &str, tax_type: &str, period_id: &str, amount_cents: i64) -> String {
        sha256_hex(format!("{abn}|{tax_type}|{period_id}|{amount_cents}").as_bytes())
    }

    /// Visit a key: blocks while another caller holds the claim, then
    /// either replays the finalized record or hands back the claim.
    pub async fn visit(&self, key: &str) -> KeyVisit {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(IdempotencyRecord {
                        key: key.to_string(),
                        status: IdempotencyStatus::Pending,
                        http_status: 0,
                        response_body: Value::Null,
                        created_at: Utc::now(),
                        completed_at: None,
                    }))
                })
                .clone()
        };

        let mut guard = slot.lock_owned().await;
        match guard.status {
            IdempotencyStatus::Pending => KeyVisit::Execute(IdempotencyClaim { guard }),
            IdempotencyStatus::Applied | IdempotencyStatus::Failed => {
                let fresh = guard
                    .completed_at
                    .map(|done| Utc::now() - done <= self.ttl)
                    .unwrap_or(false);
                if fresh {
                    KeyVisit::Replay(guard.clone())
                } else {
                    // TTL elapsed: reset and let the caller re-execute.
                    guard.status = IdempotencyStatus::Pending;
                    guard.http_status = 0;
                    guard.response_body = Value::Null;
                    guard.created_at = Utc::now();
                    guard.completed_at = None;
                    KeyVisit::Execute(IdempotencyClaim { guard })
                }
            }
        }
    }
}

impl IdempotencyClaim {
    pub fn key(&self) -> &str {
        &self.guard.key
    }

    /// Finalize as applied with the response to replay on later visits.
    pub fn applied(mut self, http_status: u16, response_body: Value) -> IdempotencyRecord {
        self.guard.status = IdempotencyStatus::Applied;
        self.guard.http_status = http_status;
        self.guard.response_body = response_body;
        self.guard.completed_at = Some(Utc::now());
        self.guard.clone()
    }

    /// Finalize as failed; later visits replay the original failure.
    pub fn failed(mut self, http_status: u16, response_body: Value) -> IdempotencyRecord {
        self.guard.status = IdempotencyStatus::Failed;
        self.guard.http_status = http_status;
        self.guard.response_body = response_body;
        self.guard.completed_at = Some(Utc::now());
        self.guard.clone()
    }
}
