use thiserror::Error;

/// Remittance runtime errors.
///
/// Variants group into four handling classes: validation (4xx, never
/// retried), policy (surfaced to the operator, never silently retried),
/// transient infrastructure (retried with backoff, then surfaced), and
/// integrity (fatal, halts automated processing for the affected period).
#[derive(Debug, Error)]
pub enum RemitError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("destination '{0}' is not allow-listed")]
    DestinationNotAllowed(String),

    #[error("insufficient balance: debit {debit_cents} exceeds balance {balance_cents}")]
    InsufficientBalance {
        debit_cents: i64,
        balance_cents: i64,
    },

    #[error("period {period} is in state '{actual}', expected '{expected}'")]
    InvalidPeriodState {
        period: String,
        expected: String,
        actual: String,
    },

    #[error("over-settlement on txn '{txn_id}' component {component}: cumulative {attempted_cents} exceeds cap {cap_cents}")]
    OverSettlement {
        txn_id: String,
        component: String,
        attempted_cents: i64,
        cap_cents: i64,
    },

    #[error("release token rejected: {0}")]
    RptRejected(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("kms backend error: {0}")]
    Kms(String),

    #[error("circuit open for rail endpoint '{0}'")]
    CircuitOpen(String),

    #[error("transient failure: {message}")]
    Transient {
        message: String,
        upstream_status: Option<u16>,
    },

    #[error("rail rejected request: {message}")]
    RailRejected {
        message: String,
        upstream_status: Option<u16>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemitError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            upstream_status: None,
        }
    }

    pub fn transient_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Transient {
            message: message.into(),
            upstream_status: Some(status),
        }
    }

    /// Retry eligibility: only transient infrastructure failures.
    /// Circuit-open is transient for callers but must not consume a
    /// retry budget, so it answers false here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// HTTP-style status for this error, also cached on idempotency
    /// records so replays reproduce the original outcome verbatim.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::RptRejected(_) => 400,
            Self::DestinationNotAllowed(_) => 403,
            Self::NotFound(_) => 404,
            Self::InsufficientBalance { .. }
            | Self::InvalidPeriodState { .. }
            | Self::OverSettlement { .. } => 409,
            Self::RailRejected { upstream_status, .. } => upstream_status.unwrap_or(400),
            Self::CircuitOpen(_) | Self::Transient { .. } => 503,
            Self::Integrity(_)
            | Self::Kms(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Serialization(_) => 500,
        }
    }
}
