//! Bank rail dispatch adapters.
//!
//! Implementations of the `remit-core` rail seam: the resilient
//! dispatcher (circuit breaker, retry, dry-run), the real HTTPS/mTLS
//! provider, the deterministic mock, and the shadow comparison wrapper.
//! The composition root stacks them: provider -> (shadow) -> dispatcher.

#![deny(unsafe_code)]

pub mod breaker;
pub mod dispatcher;
pub mod http;
pub mod mock;
pub mod shadow;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dispatcher::{DispatcherConfig, RailDispatcher, RetryPolicy};
pub use http::{HttpRail, HttpRailConfig};
pub use mock::{AlwaysFailRail, MockRail};
pub use shadow::ShadowRail;
