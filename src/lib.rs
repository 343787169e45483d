//! # ai-orchestrator
//!
//! AI 后端编排层：在多个可互换的 AI 服务后端之上提供统一入口、负载均衡、
//! 熔断保护、响应缓存与指标采集。
//!
//! An orchestration layer over interchangeable AI service backends, providing
//! a single entry point with load balancing, circuit breaking, response
//! caching and per-call metrics.
//!
//! ## Overview
//!
//! Applications talk to one [`Orchestrator`] instead of individual AI
//! backends. Backends are registered at runtime with a validated
//! [`ServiceConfig`]; every request is routed to a healthy backend by a
//! configurable selection algorithm, executed through that backend's circuit
//! breaker under a timeout, and recorded in the metrics collector. Results
//! of idempotent operations are cached by a fingerprint of their normalized
//! parameters.
//!
//! ## Core Philosophy
//!
//! - **Single Entry Point**: one facade for generation, topics, optimization and chat
//! - **Fail Fast, Never Retry**: open circuits reject immediately; retries belong to adapters
//! - **Explicit Wiring**: no global state; construction via [`OrchestratorBuilder`], lifecycle via explicit start/stop
//! - **Locks For Bookkeeping Only**: no lock is ever held across a backend call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_orchestrator::{Orchestrator, ServiceConfig};
//! use ai_orchestrator::types::GenerateTextRequest;
//! # use std::sync::Arc;
//! # fn mock_factory() -> Arc<dyn ai_orchestrator::adapter::AdapterFactory> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> ai_orchestrator::Result<()> {
//!     let orchestrator = Orchestrator::builder()
//!         .with_algorithm_name("round-robin")?
//!         .with_adapter_factory(mock_factory())
//!         .build()?;
//!
//!     let id = orchestrator
//!         .register_service(ServiceConfig::new("primary", "openai").with_credential("sk-..."))
//!         .await?;
//!     orchestrator.start_health_loop();
//!
//!     let response = orchestrator
//!         .generate_text(&GenerateTextRequest::new("Explain circuit breakers"))
//!         .await?;
//!     println!("{} (served by {})", response.content, response.metadata.service_id);
//!
//!     orchestrator.unregister_service(&id);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | The facade: request routing, admin API, health loop |
//! | [`adapter`] | Backend adapter trait and factory injection seam |
//! | [`service`] | Service configuration, validation and health types |
//! | [`registry`] | Authoritative map of registered backends |
//! | [`balancer`] | Selection algorithms over the healthy backend set |
//! | [`resilience`] | Circuit breaker and token-bucket rate limiting |
//! | [`cache`] | Fingerprint-keyed response cache with TTL and eviction |
//! | [`metrics`] | Per-call telemetry and on-demand aggregation |
//! | [`types`] | Request and response types for the four operations |

pub mod adapter;
pub mod balancer;
pub mod cache;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod service;
pub mod types;

// Re-export main types for convenience
pub use balancer::{LoadBalancer, SelectionAlgorithm};
pub use cache::{CacheManager, CacheManagerConfig};
pub use metrics::{MetricsCollector, MetricsFilter, ServiceMetricsSnapshot};
pub use orchestrator::{
    AggregateHealth, Orchestrator, OrchestratorBuilder, OrchestratorConfig, ServiceStatus,
};
pub use registry::{RegistryEvent, RegistryObserver, ServiceRegistry};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use service::{HealthState, HealthStatus, ServiceConfig, ServiceDescriptor};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
