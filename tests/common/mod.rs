//! Shared test doubles for integration tests.

use ai_orchestrator::adapter::{
    AdapterFactory, AdapterMetrics, BackendAdapter, ProbeResult,
};
use ai_orchestrator::service::{HealthState, ServiceConfig};
use ai_orchestrator::types::{
    ChatMessage, ChatRequest, ChatResponse, GenerateTextRequest, GenerateTextResponse,
    GenerateTopicsRequest, GenerateTopicsResponse, OptimizeContentRequest,
    OptimizeContentResponse, ResponseMetadata, TokenUsage,
};
use ai_orchestrator::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install the env-filter subscriber once per test binary so orchestrator
/// logs show up under `RUST_LOG=... cargo test -- --nocapture`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Scripted backend adapter.
///
/// Outcomes are consumed front-to-back by every operation call; an empty
/// script means success. Call counts make cache hits and fail-fast paths
/// observable from the outside.
pub struct MockAdapter {
    name: String,
    latency: Duration,
    script: Mutex<VecDeque<bool>>,
    calls: AtomicU64,
    init_fails: AtomicBool,
    probe_state: Mutex<HealthState>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            init_fails: AtomicBool::new(false),
            probe_state: Mutex::new(HealthState::Healthy),
        })
    }

    pub fn with_latency(name: impl Into<String>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            latency,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            init_fails: AtomicBool::new(false),
            probe_state: Mutex::new(HealthState::Healthy),
        })
    }

    /// Queue `n` failures ahead of any scripted successes.
    pub fn fail_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(false);
        }
    }

    /// Queue `n` explicit successes.
    pub fn succeed_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(true);
        }
    }

    pub fn fail_initialize(&self) {
        self.init_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_probe_state(&self, state: HealthState) {
        *self.probe_state.lock().unwrap() = state;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn step(&self) -> Result<u64> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if outcome {
            Ok(call)
        } else {
            Err(Error::backend(&self.name, "scripted backend failure"))
        }
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    async fn initialize(&self) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.init_fails.load(Ordering::SeqCst) {
            return Err(Error::backend(&self.name, "initialization refused"));
        }
        Ok(())
    }

    async fn generate_text(&self, request: &GenerateTextRequest) -> Result<GenerateTextResponse> {
        let call = self.step().await?;
        Ok(GenerateTextResponse {
            id: format!("{}-{}", self.name, call),
            content: format!("text for '{}' (call {call})", request.prompt),
            model: "mock-model".into(),
            usage: TokenUsage::new(10, 5),
            metadata: ResponseMetadata {
                cost: 0.001,
                ..Default::default()
            },
        })
    }

    async fn generate_topics(
        &self,
        request: &GenerateTopicsRequest,
    ) -> Result<GenerateTopicsResponse> {
        let call = self.step().await?;
        Ok(GenerateTopicsResponse {
            topics: vec![format!("topic from '{}' (call {call})", request.material)],
            model: "mock-model".into(),
            usage: TokenUsage::new(20, 8),
            metadata: ResponseMetadata::default(),
        })
    }

    async fn optimize_content(
        &self,
        request: &OptimizeContentRequest,
    ) -> Result<OptimizeContentResponse> {
        let call = self.step().await?;
        Ok(OptimizeContentResponse {
            optimized_content: format!("optimized '{}' (call {call})", request.content),
            improvements: vec!["clarity".into()],
            score: 82.0,
            usage: TokenUsage::new(30, 12),
            metadata: ResponseMetadata::default(),
        })
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let call = self.step().await?;
        Ok(ChatResponse {
            response: format!("reply to '{}' (call {call})", request.message),
            messages: vec![
                ChatMessage::user(&request.message),
                ChatMessage::assistant(format!("reply to '{}'", request.message)),
            ],
            usage: TokenUsage::new(15, 7),
            metadata: ResponseMetadata::default(),
        })
    }

    async fn health_check(&self) -> Result<ProbeResult> {
        let state = *self.probe_state.lock().unwrap();
        Ok(ProbeResult {
            state,
            response_time: Duration::from_millis(1),
            message: None,
        })
    }

    async fn get_metrics(&self) -> Result<AdapterMetrics> {
        Ok(AdapterMetrics {
            requests: self.calls(),
            ..Default::default()
        })
    }
}

/// A factory that hands out pre-built mock adapters by service name.
pub fn factory_for(adapters: Vec<(&str, Arc<MockAdapter>)>) -> Arc<dyn AdapterFactory> {
    let adapters: Vec<(String, Arc<MockAdapter>)> = adapters
        .into_iter()
        .map(|(name, adapter)| (name.to_string(), adapter))
        .collect();
    Arc::new(move |config: &ServiceConfig| {
        adapters
            .iter()
            .find(|(name, _)| *name == config.name)
            .map(|(_, adapter)| Arc::clone(adapter) as Arc<dyn BackendAdapter>)
            .ok_or_else(|| Error::backend(&config.name, "no mock adapter wired for this service"))
    })
}
