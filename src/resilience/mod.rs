//! 弹性模式模块：提供熔断器和限流器等可靠性保障机制。
//!
//! # Resilience Module
//!
//! Per-service resilience primitives composed by the orchestrator around
//! every dispatch.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | 3-state circuit breaker with a time-windowed outcome log |
//! | [`rate_limiter`] | Token bucket rate limiter for per-service throughput control |
//!
//! ## Circuit Breaker
//!
//! One breaker per registered service, living for the descriptor's lifetime:
//! - **Closed**: normal operation, outcomes feed the monitoring window
//! - **Open**: failure rate reached the threshold, calls fail fast
//! - **Half-Open**: recovery deadline passed, trial calls probe the backend
//!
//! ```rust
//! use ai_orchestrator::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(50)
//!     .with_recovery_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("svc-1", config);
//! ```
//!
//! ## Rate Limiter
//!
//! Applied before dispatch when a service configures `rate_limit`:
//!
//! ```rust
//! use ai_orchestrator::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiterConfig::from_rps(10.0).map(RateLimiter::new);
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
