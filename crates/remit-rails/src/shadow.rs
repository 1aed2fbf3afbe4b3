//! Shadow comparison wrapper.
//!
//! Fans every call out to a primary and a secondary provider. The
//! primary's result is authoritative and returns immediately; the
//! secondary runs on a spawned task and any divergence is logged, never
//! surfaced. Used to run a candidate gateway (or the mock) alongside the
//! real one before cutover.

use async_trait::async_trait;
use remit_core::rails::{RailProvider, RailReceipt, RailRequest};
use remit_core::RemitError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct ShadowRail {
    primary: Arc<dyn RailProvider>,
    secondary: Arc<dyn RailProvider>,
    divergences: Arc<AtomicU64>,
}

impl ShadowRail {
    pub fn new(primary: Arc<dyn RailProvider>, secondary: Arc<dyn RailProvider>) -> Self {
        Self {
            primary,
            secondary,
            divergences: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn divergence_count(&self) -> u64 {
        self.divergences.load(Ordering::SeqCst)
    }

    async fn shadowed(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        let primary_result = self.primary.dispatch(request).await;

        let secondary = self.secondary.clone();
        let divergences = self.divergences.clone();
        let request = request.clone();
        let primary_ok = primary_result.is_ok();
        let primary_reference = primary_result
            .as_ref()
            .map(|r| r.provider_reference.clone())
            .ok();
        tokio::spawn(async move {
            let secondary_result = secondary.dispatch(&request).await;
            let diverged = match (&primary_ok, &secondary_result) {
                (true, Ok(receipt)) => {
                    primary_reference.as_deref() != Some(receipt.provider_reference.as_str())
                }
                (false, Err(_)) => false,
                _ => true,
            };
            if diverged {
                divergences.fetch_add(1, Ordering::SeqCst);
                warn!(
                    rail = %request.kind,
                    key = %request.idempotency_key,
                    primary_ok,
                    secondary_ok = secondary_result.is_ok(),
                    "shadow rail divergence"
                );
            }
        });

        primary_result
    }
}

#[async_trait]
impl RailProvider for ShadowRail {
    fn rail_id(&self) -> &'static str {
        "shadow"
    }

    async fn eft(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.shadowed(request).await
    }

    async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.shadowed(request).await
    }

    async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.shadowed(request).await
    }

    async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.shadowed(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{AlwaysFailRail, MockRail};
    use remit_core::rails::RailKind;
    use std::time::Duration;

    fn request() -> RailRequest {
        RailRequest {
            kind: RailKind::Eft,
            amount_cents: 100,
            destination: "acct".to_string(),
            reference: "R".to_string(),
            idempotency_key: "shadow-key".to_string(),
        }
    }

    async fn wait_for_divergence(shadow: &ShadowRail, expected: u64) {
        for _ in 0..100 {
            if shadow.divergence_count() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {expected} divergences, saw {}",
            shadow.divergence_count()
        );
    }

    #[tokio::test]
    async fn primary_result_is_authoritative() {
        let shadow = ShadowRail::new(
            Arc::new(MockRail),
            Arc::new(AlwaysFailRail::transient("secondary down", None)),
        );

        let receipt = shadow.dispatch(&request()).await.unwrap();
        assert!(receipt.provider_reference.starts_with("eft-"));
        wait_for_divergence(&shadow, 1).await;
    }

    #[tokio::test]
    async fn agreeing_delegates_record_no_divergence() {
        // Two MockRail instances derive identical references per key.
        let shadow = ShadowRail::new(Arc::new(MockRail), Arc::new(MockRail));
        shadow.dispatch(&request()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shadow.divergence_count(), 0);
    }

    #[tokio::test]
    async fn primary_failure_surfaces_even_if_secondary_succeeds() {
        let shadow = ShadowRail::new(
            Arc::new(AlwaysFailRail::rejecting("primary says no", Some(400))),
            Arc::new(MockRail),
        );

        let err = shadow.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, RemitError::RailRejected { .. }));
        wait_for_divergence(&shadow, 1).await;
    }
}
