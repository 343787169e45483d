//! 适配器模块：后端适配器必须实现的能力契约。
//!
//! # Adapter Module
//!
//! The orchestration layer is adapter-agnostic: it talks to backends only
//! through the [`BackendAdapter`] capability contract and never depends on a
//! concrete provider. Status reports are built exclusively from this
//! interface; there is no structural or reflective access to adapter
//! internals.
//!
//! Concrete adapters (HTTP providers, local models, test doubles) live
//! outside this crate; the composition root supplies an [`AdapterFactory`]
//! that turns a validated [`ServiceConfig`] into an adapter instance at
//! registration time.

use crate::service::{HealthState, ServiceConfig};
use crate::types::{
    ChatRequest, ChatResponse, GenerateTextRequest, GenerateTextResponse, GenerateTopicsRequest,
    GenerateTopicsResponse, OptimizeContentRequest, OptimizeContentResponse,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result of one health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub state: HealthState,
    pub response_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy(response_time: Duration) -> Self {
        Self {
            state: HealthState::Healthy,
            response_time,
            message: None,
        }
    }

    pub fn unhealthy(response_time: Duration, message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            response_time,
            message: Some(message.into()),
        }
    }
}

/// Adapter-internal counters, reported through the capability interface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub requests: u64,
    pub errors: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Adapter-internal cache counters (providers with a local cache).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdapterCacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Capability contract every backend adapter must satisfy.
///
/// The four request operations mirror the orchestrator's public API; the
/// remaining methods cover lifecycle, observability and configuration.
/// `update_config`, `clear_cache` and `cache_stats` default to no-ops since
/// not every provider has local state to manage.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// One-time setup (connection checks, credential validation). Runs before
    /// the service is registered; a failure here registers nothing.
    async fn initialize(&self) -> Result<()>;

    async fn generate_text(&self, request: &GenerateTextRequest) -> Result<GenerateTextResponse>;

    async fn generate_topics(
        &self,
        request: &GenerateTopicsRequest,
    ) -> Result<GenerateTopicsResponse>;

    async fn optimize_content(
        &self,
        request: &OptimizeContentRequest,
    ) -> Result<OptimizeContentResponse>;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Liveness probe invoked by the orchestrator's health-check loop.
    async fn health_check(&self) -> Result<ProbeResult>;

    /// Adapter-internal counters for status reports.
    async fn get_metrics(&self) -> Result<AdapterMetrics>;

    /// Push an updated config (retry policy changes etc.) into the adapter.
    async fn update_config(&self, _config: &ServiceConfig) -> Result<()> {
        Ok(())
    }

    /// Drop any adapter-local cache.
    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    async fn cache_stats(&self) -> Result<AdapterCacheStats> {
        Ok(AdapterCacheStats::default())
    }
}

/// Builds adapter instances from validated configs.
///
/// Injected into the orchestrator at construction so `register_service`
/// can stay provider-agnostic.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, config: &ServiceConfig) -> Result<Arc<dyn BackendAdapter>>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&ServiceConfig) -> Result<Arc<dyn BackendAdapter>> + Send + Sync,
{
    fn create(&self, config: &ServiceConfig) -> Result<Arc<dyn BackendAdapter>> {
        self(config)
    }
}
