//! Release Payment Token issuance and verification.
//!
//! The canonical serialization of the payload is the exact byte sequence
//! that gets hashed and signed; both live in [`crate::canonical`].

use crate::canonical::{sha256_hex, to_canonical_json};
use crate::error::RemitError;
use crate::kms::{KmsProvider, KmsVerifier};
use crate::types::{Period, RptPayload, RptStatus, RptToken};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Builds and signs release-authorization tokens from period snapshots.
pub struct RptIssuer {
    kms: Arc<dyn KmsProvider>,
    ttl: Duration,
}

impl RptIssuer {
    pub fn new(kms: Arc<dyn KmsProvider>, ttl: Duration) -> Self {
        Self { kms, ttl }
    }

    pub fn with_default_ttl(kms: Arc<dyn KmsProvider>) -> Self {
        Self::new(kms, Duration::minutes(15))
    }

    /// Build the canonical payload from a period snapshot and the
    /// ledger's current hash state, sign it, and return an active token.
    ///
    /// The caller (the period transition) guarantees the anomaly and
    /// discrepancy checks have already passed and supersedes any prior
    /// active token for the period.
    pub async fn issue(
        &self,
        period: &Period,
        amount_cents: i64,
        rail_id: &str,
        reference: &str,
    ) -> Result<RptToken, RemitError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + self.ttl;
        let payload = RptPayload {
            abn: period.key.abn.clone(),
            period_id: period.key.period_id.clone(),
            tax_type: period.key.tax_type,
            amount_cents,
            merkle_root: period.merkle_root.clone(),
            running_balance_hash: period.running_balance_hash.clone(),
            anomaly_vector: period.anomaly_vector,
            thresholds: period.thresholds,
            rail_id: rail_id.to_string(),
            reference: reference.to_string(),
            expiry_ts: expires_at,
            nonce: Uuid::new_v4().to_string(),
        };

        let canonical = to_canonical_json(&payload)?;
        let payload_sha256 = sha256_hex(canonical.as_bytes());
        let signature = self.kms.sign(canonical.as_bytes()).await?;

        Ok(RptToken {
            payload,
            canonical,
            payload_sha256,
            signature: BASE64.encode(signature),
            key_id: self.kms.key_id().to_string(),
            status: RptStatus::Active,
            expires_at,
            issued_at,
        })
    }
}

/// Token verification outcome with the failing check, for audit records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RptVerification {
    Valid,
    DigestMismatch,
    Expired,
    SignatureInvalid,
    NotActive,
}

impl RptVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Recompute the stored canonical string's digest, check expiry, then
/// verify the detached signature through the KMS verification handle.
/// An expired token fails regardless of signature validity.
pub async fn verify_token(
    token: &RptToken,
    verifier: &KmsVerifier,
    now: DateTime<Utc>,
) -> Result<RptVerification, RemitError> {
    if token.status != RptStatus::Active {
        return Ok(RptVerification::NotActive);
    }
    if sha256_hex(token.canonical.as_bytes()) != token.payload_sha256 {
        return Ok(RptVerification::DigestMismatch);
    }
    if now > token.expires_at {
        return Ok(RptVerification::Expired);
    }

    let signature = BASE64
        .decode(token.signature.as_bytes())
        .map_err(|_| RemitError::Integrity("token signature is not base64".to_string()))?;
    if verifier
        .verify(token.canonical.as_bytes(), &signature)
        .await?
    {
        Ok(RptVerification::Valid)
    } else {
        Ok(RptVerification::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use crate::types::{AnomalyThresholds, PeriodKey, TaxType};

    fn ready_period() -> Period {
        let mut period = Period::open(
            PeriodKey::new("51824753556", TaxType::Gst, "2025-09"),
            AnomalyThresholds::default(),
        );
        period.merkle_root = "ab".repeat(32);
        period.running_balance_hash = "cd".repeat(32);
        period
    }

    fn fixed_kms() -> Arc<LocalKms> {
        Arc::new(LocalKms::from_seed("rpt-test-key", &[7u8; 32]))
    }

    #[tokio::test]
    async fn issue_then_verify_round_trips() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms.clone());
        let token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();

        assert_eq!(token.status, RptStatus::Active);
        assert_eq!(token.key_id, "rpt-test-key");
        assert_eq!(token.payload_sha256, sha256_hex(token.canonical.as_bytes()));

        let verifier = KmsVerifier::new(kms);
        let outcome = verify_token(&token, &verifier, Utc::now()).await.unwrap();
        assert_eq!(outcome, RptVerification::Valid);
    }

    #[tokio::test]
    async fn expired_token_fails_even_with_valid_signature() {
        let kms = fixed_kms();
        let issuer = RptIssuer::new(kms.clone(), Duration::minutes(15));
        let token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();

        let verifier = KmsVerifier::new(kms);
        let later = token.expires_at + Duration::seconds(1);
        let outcome = verify_token(&token, &verifier, later).await.unwrap();
        assert_eq!(outcome, RptVerification::Expired);
    }

    #[tokio::test]
    async fn tampered_canonical_is_a_digest_mismatch() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms.clone());
        let mut token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();
        token.canonical = token.canonical.replace("150000", "150001");

        let verifier = KmsVerifier::new(kms);
        let outcome = verify_token(&token, &verifier, Utc::now()).await.unwrap();
        assert_eq!(outcome, RptVerification::DigestMismatch);
    }

    #[tokio::test]
    async fn foreign_signature_is_invalid() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms);
        let token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();

        let other = Arc::new(LocalKms::from_seed("other-key", &[9u8; 32]));
        let verifier = KmsVerifier::new(other);
        let outcome = verify_token(&token, &verifier, Utc::now()).await.unwrap();
        assert_eq!(outcome, RptVerification::SignatureInvalid);
    }

    #[tokio::test]
    async fn consumed_token_does_not_verify() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms.clone());
        let mut token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();
        token.status = RptStatus::Consumed;

        let verifier = KmsVerifier::new(kms);
        let outcome = verify_token(&token, &verifier, Utc::now()).await.unwrap();
        assert_eq!(outcome, RptVerification::NotActive);
    }

    #[tokio::test]
    async fn canonical_payload_sorts_fields() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms);
        let token = issuer
            .issue(&ready_period(), 150_000, "eft", "INV-42")
            .await
            .unwrap();

        // Keys appear in sorted order in the canonical bytes.
        let abn_pos = token.canonical.find("\"abn\"").unwrap();
        let amount_pos = token.canonical.find("\"amount_cents\"").unwrap();
        let thresholds_pos = token.canonical.find("\"thresholds\"").unwrap();
        assert!(abn_pos < amount_pos && amount_pos < thresholds_pos);
        assert!(!token.canonical.contains(' '));
    }

    #[tokio::test]
    async fn nonce_differs_between_issuances() {
        let kms = fixed_kms();
        let issuer = RptIssuer::with_default_ttl(kms);
        let period = ready_period();
        let a = issuer.issue(&period, 1_000, "eft", "R").await.unwrap();
        let b = issuer.issue(&period, 1_000, "eft", "R").await.unwrap();
        assert_ne!(a.payload.nonce, b.payload.nonce);
        assert_ne!(a.payload_sha256, b.payload_sha256);
    }
}
