//! Resilient dispatch decorator.
//!
//! Wraps any [`RailProvider`] with the shared circuit breaker, bounded
//! per-call timeouts, exponential-backoff retry of transient failures,
//! and the deterministic dry-run mode. Because it implements the same
//! trait, the composition root can stack it over a mock, real, or
//! shadow provider without the release engine knowing.

use crate::breaker::CircuitBreaker;
use async_trait::async_trait;
use remit_core::canonical::sha256_hex;
use remit_core::rails::{RailProvider, RailReceipt, RailRequest};
use remit_core::RemitError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff schedule: `base * 2^attempt`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Bound on each individual attempt, not the whole retry loop.
    pub call_timeout: Duration,
    /// When set, no network call is ever made; references derive from
    /// the idempotency key so replays are reproducible.
    pub dry_run: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(10),
            dry_run: false,
        }
    }
}

pub struct RailDispatcher {
    inner: Arc<dyn RailProvider>,
    breaker: Arc<CircuitBreaker>,
    config: DispatcherConfig,
}

impl RailDispatcher {
    pub fn new(
        inner: Arc<dyn RailProvider>,
        breaker: Arc<CircuitBreaker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner,
            breaker,
            config,
        }
    }

    /// Deterministic synthetic receipt: `dryrun-SHA256(idempotencyKey)`.
    fn dry_run_receipt(request: &RailRequest) -> RailReceipt {
        let reference = format!("dryrun-{}", sha256_hex(request.idempotency_key.as_bytes()));
        RailReceipt {
            provider_reference: reference,
            raw: json!({
                "mode": "dry_run",
                "rail": request.kind.as_str(),
                "amount_cents": request.amount_cents,
            }),
            synthetic: true,
        }
    }

    async fn call(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        if self.config.dry_run {
            debug!(rail = %request.kind, key = %request.idempotency_key, "dry-run dispatch");
            return Ok(Self::dry_run_receipt(request));
        }

        if !self.breaker.try_acquire() {
            return Err(RemitError::CircuitOpen(
                self.breaker.endpoint().to_string(),
            ));
        }

        let mut attempt = 0u32;
        loop {
            let outcome =
                match tokio::time::timeout(self.config.call_timeout, self.inner.dispatch(request))
                    .await
                {
                    Err(_) => Err(RemitError::transient("rail call timed out")),
                    Ok(result) => result,
                };

            match outcome {
                Ok(receipt) => {
                    self.breaker.record_success();
                    return Ok(receipt);
                }
                Err(err) if err.is_retryable() => {
                    self.breaker.record_failure();
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts {
                        warn!(
                            rail = %request.kind,
                            attempts = attempt,
                            error = %err,
                            "rail dispatch exhausted retries"
                        );
                        return Err(err);
                    }
                    let delay = self.config.retry.delay_for(attempt - 1);
                    debug!(
                        rail = %request.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying transient rail failure"
                    );
                    // Cooperative wait: never blocks other in-flight calls.
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // Validation-class rejections are final and say nothing
                    // about downstream health; the breaker ignores them.
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl RailProvider for RailDispatcher {
    fn rail_id(&self) -> &'static str {
        "dispatcher"
    }

    async fn eft(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.call(request).await
    }

    async fn bpay(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.call(request).await
    }

    async fn payto_sweep(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.call(request).await
    }

    async fn payto_debit(&self, request: &RailRequest) -> Result<RailReceipt, RemitError> {
        self.call(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use remit_core::rails::RailKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transient error the first `failures` calls, then
    /// succeeds.
    struct FlakyRail {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyRail {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn respond(&self) -> Result<RailReceipt, RemitError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RemitError::transient_with_status("upstream 503", 503))
            } else {
                Ok(RailReceipt {
                    provider_reference: format!("flaky-{call}"),
                    raw: json!({}),
                    synthetic: true,
                })
            }
        }
    }

    #[async_trait]
    impl RailProvider for FlakyRail {
        fn rail_id(&self) -> &'static str {
            "flaky"
        }

        async fn eft(&self, _r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.respond()
        }
        async fn bpay(&self, _r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.respond()
        }
        async fn payto_sweep(&self, _r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.respond()
        }
        async fn payto_debit(&self, _r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.respond()
        }
    }

    /// Always rejects with a validation-class error.
    struct RejectingRail {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RailProvider for RejectingRail {
        fn rail_id(&self) -> &'static str {
            "rejecting"
        }

        async fn eft(&self, _r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RemitError::RailRejected {
                message: "invalid destination".to_string(),
                upstream_status: Some(400),
            })
        }
        async fn bpay(&self, r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(r).await
        }
        async fn payto_sweep(&self, r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(r).await
        }
        async fn payto_debit(&self, r: &RailRequest) -> Result<RailReceipt, RemitError> {
            self.eft(r).await
        }
    }

    fn request() -> RailRequest {
        RailRequest {
            kind: RailKind::Eft,
            amount_cents: 150_000,
            destination: "ato-owa-gst".to_string(),
            reference: "INV-42".to_string(),
            idempotency_key: "key-1".to_string(),
        }
    }

    fn dispatcher_over(
        inner: Arc<dyn RailProvider>,
        breaker_config: CircuitBreakerConfig,
        config: DispatcherConfig,
    ) -> (RailDispatcher, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new("eft-endpoint", breaker_config));
        (
            RailDispatcher::new(inner, breaker.clone(), config),
            breaker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let flaky = Arc::new(FlakyRail::new(2));
        let (dispatcher, _) = dispatcher_over(
            flaky.clone(),
            CircuitBreakerConfig {
                failure_threshold: 10,
                cooldown: Duration::from_secs(30),
            },
            DispatcherConfig::default(),
        );

        let receipt = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(receipt.provider_reference, "flaky-2");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_and_surface_the_last_error() {
        let flaky = Arc::new(FlakyRail::new(10));
        let (dispatcher, _) = dispatcher_over(
            flaky.clone(),
            CircuitBreakerConfig {
                failure_threshold: 100,
                cooldown: Duration::from_secs(30),
            },
            DispatcherConfig::default(),
        );

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            RemitError::Transient {
                upstream_status: Some(503),
                ..
            }
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_rejections_are_never_retried() {
        let rejecting = Arc::new(RejectingRail {
            calls: AtomicU32::new(0),
        });
        let (dispatcher, breaker) = dispatcher_over(
            rejecting.clone(),
            CircuitBreakerConfig::default(),
            DispatcherConfig::default(),
        );

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, RemitError::RailRejected { .. }));
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 1);
        // Rejections say nothing about downstream health.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_io() {
        let flaky = Arc::new(FlakyRail::new(100));
        let (dispatcher, breaker) = dispatcher_over(
            flaky.clone(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
            },
            DispatcherConfig::default(),
        );

        let _ = dispatcher.dispatch(&request()).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        let calls_before = flaky.calls.load(Ordering::SeqCst);

        let err = dispatcher.dispatch(&request()).await.unwrap_err();
        assert!(matches!(err, RemitError::CircuitOpen(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_before);
    }

    // Real time here: the breaker's cooldown clock is wall time, which
    // the paused tokio clock does not advance.
    #[tokio::test]
    async fn half_open_probe_success_closes_the_circuit() {
        let flaky = Arc::new(FlakyRail::new(3));
        let (dispatcher, breaker) = dispatcher_over(
            flaky.clone(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(50),
            },
            DispatcherConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                },
                ..Default::default()
            },
        );

        let _ = dispatcher.dispatch(&request()).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let receipt = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(receipt.provider_reference, "flaky-3");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dry_run_is_deterministic_and_skips_the_network() {
        let flaky = Arc::new(FlakyRail::new(100));
        let (dispatcher, _) = dispatcher_over(
            flaky.clone(),
            CircuitBreakerConfig::default(),
            DispatcherConfig {
                dry_run: true,
                ..Default::default()
            },
        );

        let a = dispatcher.dispatch(&request()).await.unwrap();
        let b = dispatcher.dispatch(&request()).await.unwrap();
        assert_eq!(a.provider_reference, b.provider_reference);
        assert!(a.provider_reference.starts_with("dryrun-"));
        assert_eq!(
            a.provider_reference,
            format!("dryrun-{}", sha256_hex(b"key-1"))
        );
        assert!(a.synthetic);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }
}
