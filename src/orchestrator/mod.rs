//! 编排器模块：统一请求入口，组合注册表、均衡器、熔断器、缓存与指标。
//!
//! # Orchestrator Module
//!
//! The [`Orchestrator`] is the facade over the whole layer. A request enters
//! here, hits the cache (a hit short-circuits), is routed by the
//! [`LoadBalancer`] to a backend from the [`ServiceRegistry`]'s healthy set,
//! executes through that backend's [`CircuitBreaker`], feeds the
//! [`MetricsCollector`] and the registry's health view, and, on success,
//! is written through to the cache.
//!
//! Construction is explicit: build one from a composition root with
//! [`OrchestratorBuilder`], injecting the [`AdapterFactory`] that turns
//! validated service configs into adapter instances. There is no global
//! singleton, and the health-check loop is an explicit, testable lifecycle
//! ([`Orchestrator::start_health_loop`] / [`Orchestrator::stop_health_loop`]).
//!
//! This layer never retries: a dispatch failure updates the service's health
//! and circuit counters, then propagates unchanged. Retries are the
//! adapter's concern, driven by its configured [`RetryPolicy`].
//!
//! [`RetryPolicy`]: crate::service::RetryPolicy

use crate::adapter::{AdapterFactory, AdapterMetrics, BackendAdapter};
use crate::balancer::{LoadBalancer, SelectionAlgorithm};
use crate::cache::key::fingerprint;
use crate::cache::{CacheManager, CacheManagerConfig, CacheStats};
use crate::metrics::{
    MetricsCollector, MetricsCollectorConfig, MetricsFilter, RankingMetric, ServiceMetricsSnapshot,
    ServiceRanking,
};
use crate::registry::{RegistryStatistics, ServiceRegistry};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics};
use crate::service::{HealthState, HealthStatus, ServiceConfig, ServiceDescriptor};
use crate::types::{
    ChatRequest, ChatResponse, GenerateTextRequest, GenerateTextResponse, GenerateTopicsRequest,
    GenerateTopicsResponse, OptimizeContentRequest, OptimizeContentResponse, ResponseMetadata,
    TokenUsage,
};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Orchestrator-wide configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cache key namespace; lets several orchestrators share nothing.
    pub namespace: String,
    pub algorithm: SelectionAlgorithm,
    pub health_check_interval: Duration,
    /// Bound on each adapter health probe.
    pub health_probe_timeout: Duration,
    pub cache: CacheManagerConfig,
    pub metrics: MetricsCollectorConfig,
    /// Per-operation cache TTLs. A service-level `CachePolicy.ttl` overrides
    /// these for entries it produces.
    pub generate_text_ttl: Duration,
    pub generate_topics_ttl: Duration,
    pub optimize_content_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "orchestrator".to_string(),
            algorithm: SelectionAlgorithm::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            cache: CacheManagerConfig::default(),
            metrics: MetricsCollectorConfig::default(),
            generate_text_ttl: Duration::from_secs(3600),
            generate_topics_ttl: Duration::from_secs(1800),
            optimize_content_ttl: Duration::from_secs(1800),
        }
    }
}

/// Builder for [`Orchestrator`]. The adapter factory is mandatory.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    factory: Option<Arc<dyn AdapterFactory>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            factory: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_algorithm(mut self, algorithm: SelectionAlgorithm) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    /// Parse and set the algorithm by name; unknown names fail at `build`.
    pub fn with_algorithm_name(mut self, name: &str) -> Result<Self> {
        self.config.algorithm = name.parse()?;
        Ok(self)
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    pub fn with_adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Arc<Orchestrator>> {
        let factory = self.factory.ok_or_else(|| {
            Error::configuration(
                "orchestrator requires an adapter factory",
                vec!["call with_adapter_factory before build".to_string()],
            )
        })?;
        if self.config.health_check_interval.is_zero() {
            return Err(Error::configuration(
                "invalid orchestrator config",
                vec!["health_check_interval must be greater than zero".to_string()],
            ));
        }
        let registry = Arc::new(ServiceRegistry::new());
        let balancer = LoadBalancer::new(Arc::clone(&registry), self.config.algorithm);
        Ok(Arc::new(Orchestrator {
            registry,
            balancer,
            cache: CacheManager::new(self.config.cache.clone()),
            metrics: Arc::new(MetricsCollector::new(self.config.metrics.clone())),
            runtimes: RwLock::new(HashMap::new()),
            factory,
            config: self.config,
            health_task: Mutex::new(None),
        }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-service moving parts built at registration.
struct ServiceRuntime {
    adapter: Arc<dyn BackendAdapter>,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
}

/// Aggregate health report across all registered services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub state: HealthState,
    pub healthy: usize,
    pub total: usize,
    /// Percentage of strictly-healthy backends.
    pub healthy_percentage: f64,
    pub services: Vec<ServiceHealthSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthSummary {
    pub id: String,
    pub name: String,
    pub state: HealthState,
}

/// Full per-service status line, built only through the adapter capability
/// interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub health: HealthStatus,
    pub circuit: CircuitBreakerMetrics,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_metrics: Option<AdapterMetrics>,
}

/// Everything `get_metrics` returns.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub overall: ServiceMetricsSnapshot,
    pub per_service: HashMap<String, ServiceMetricsSnapshot>,
    pub cache: CacheStats,
    pub registry: RegistryStatistics,
}

/// Response types the orchestrator can cache and attribute.
trait OrchestratedResponse {
    fn metadata_mut(&mut self) -> &mut ResponseMetadata;
    fn metadata(&self) -> &ResponseMetadata;
    fn usage(&self) -> TokenUsage;
}

macro_rules! orchestrated_response {
    ($ty:ty) => {
        impl OrchestratedResponse for $ty {
            fn metadata_mut(&mut self) -> &mut ResponseMetadata {
                &mut self.metadata
            }
            fn metadata(&self) -> &ResponseMetadata {
                &self.metadata
            }
            fn usage(&self) -> TokenUsage {
                self.usage
            }
        }
    };
}

orchestrated_response!(GenerateTextResponse);
orchestrated_response!(GenerateTopicsResponse);
orchestrated_response!(OptimizeContentResponse);
orchestrated_response!(ChatResponse);

/// Facade over registry, balancer, breakers, cache and metrics.
pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    balancer: LoadBalancer,
    cache: CacheManager,
    metrics: Arc<MetricsCollector>,
    runtimes: RwLock<HashMap<String, ServiceRuntime>>,
    factory: Arc<dyn AdapterFactory>,
    config: OrchestratorConfig,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    // ---- administrative API ------------------------------------------------

    /// Validate `config`, build the matching circuit breaker, rate limiter
    /// and adapter, initialize the adapter, then register. Nothing is
    /// registered when validation or initialization fails.
    pub async fn register_service(&self, config: ServiceConfig) -> Result<String> {
        config.validate()?;
        let descriptor = ServiceDescriptor::from_config(config);
        if self.registry.contains(&descriptor.id) {
            return Err(Error::DuplicateService {
                id: descriptor.id.clone(),
            });
        }

        let adapter = self.factory.create(&descriptor.config)?;
        adapter.initialize().await?;

        let breaker = Arc::new(CircuitBreaker::new(
            descriptor.id.clone(),
            (&descriptor.config.circuit).into(),
        ));
        let limiter = descriptor
            .config
            .rate_limit
            .and_then(RateLimiterConfig::from_rps)
            .map(|cfg| Arc::new(RateLimiter::new(cfg)));

        let id = descriptor.id.clone();
        {
            // Registry insert and runtime install must be atomic with
            // respect to other registrations. The runtimes write lock is
            // held across both, so a racing duplicate fails in `register`
            // before it can touch the winner's runtime, and a dispatcher
            // that sees the new entry blocks until its runtime exists.
            let mut runtimes = self.runtimes_write();
            self.registry.register(descriptor)?;
            runtimes.insert(
                id.clone(),
                ServiceRuntime {
                    adapter,
                    breaker,
                    limiter,
                },
            );
        }
        Ok(id)
    }

    /// Remove a service and its runtime. Idempotent.
    pub fn unregister_service(&self, id: &str) -> bool {
        self.runtimes_write().remove(id);
        self.registry.unregister(id)
    }

    /// Validate and push an updated config into the registry and the
    /// adapter. The circuit breaker keeps its state; thresholds take effect
    /// on re-registration.
    pub async fn update_service_config(&self, id: &str, config: ServiceConfig) -> Result<()> {
        config.validate()?;
        let adapter = self.runtime_of(id)?.adapter;
        adapter.update_config(&config).await?;
        self.registry.update_config(id, config)
    }

    /// Aggregate status by percentage of strictly-healthy backends:
    /// ≥80% healthy, ≥50% degraded, else unhealthy. An empty registry is
    /// unhealthy.
    pub fn health_check(&self) -> AggregateHealth {
        let descriptors = self.registry.all();
        let total = descriptors.len();
        let mut services = Vec::with_capacity(total);
        let mut healthy = 0usize;
        for descriptor in descriptors {
            let state = self
                .registry
                .health_of(&descriptor.id)
                .map(|h| h.state)
                .unwrap_or(HealthState::Unhealthy);
            if state == HealthState::Healthy {
                healthy += 1;
            }
            services.push(ServiceHealthSummary {
                id: descriptor.id,
                name: descriptor.name,
                state,
            });
        }
        let percentage = if total == 0 {
            0.0
        } else {
            healthy as f64 / total as f64 * 100.0
        };
        let state = if percentage >= 80.0 {
            HealthState::Healthy
        } else if percentage >= 50.0 {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };
        AggregateHealth {
            state,
            healthy,
            total,
            healthy_percentage: percentage,
            services,
        }
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        let mut per_service = HashMap::new();
        for descriptor in self.registry.all() {
            per_service.insert(
                descriptor.id.clone(),
                self.metrics.snapshot(&MetricsFilter::for_service(descriptor.id)),
            );
        }
        OrchestratorMetrics {
            overall: self.metrics.snapshot(&MetricsFilter::default()),
            per_service,
            cache: self.cache.stats(),
            registry: self.registry.statistics(),
        }
    }

    pub fn service_ranking(&self, metric: RankingMetric, limit: usize) -> Vec<ServiceRanking> {
        self.metrics.ranking(metric, limit)
    }

    /// Clear cached responses matching `pattern` (`None` clears everything).
    /// Returns the cleared count.
    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        let cleared = self.cache.clear(pattern);
        tracing::info!(cleared, pattern = pattern.unwrap_or("*"), "cache cleared");
        cleared
    }

    /// Per-service status built through the adapter capability interface.
    pub async fn service_statuses(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::new();
        for descriptor in self.registry.all() {
            let Ok(runtime) = self.runtime_of(&descriptor.id) else {
                continue;
            };
            let adapter_metrics = runtime.adapter.get_metrics().await.ok();
            let health = self
                .registry
                .health_of(&descriptor.id)
                .unwrap_or_else(|| HealthStatus::with_state(HealthState::Unhealthy));
            statuses.push(ServiceStatus {
                in_flight: self.balancer.in_flight_of(&descriptor.id),
                circuit: runtime.breaker.metrics(),
                id: descriptor.id,
                name: descriptor.name,
                kind: descriptor.kind,
                health,
                adapter_metrics,
            });
        }
        statuses
    }

    /// Operator override: reset a service's circuit breaker to CLOSED.
    pub fn reset_circuit(&self, id: &str) -> Result<()> {
        self.runtime_of(id)?.breaker.reset();
        Ok(())
    }

    // ---- request API -------------------------------------------------------

    pub async fn generate_text(
        &self,
        request: &GenerateTextRequest,
    ) -> Result<GenerateTextResponse> {
        let params = serde_json::to_value(request)?;
        let req = request.clone();
        self.cached_op(
            "generate_text",
            params,
            self.config.generate_text_ttl,
            move |adapter| Box::pin(async move { adapter.generate_text(&req).await }),
        )
        .await
    }

    pub async fn generate_topics(
        &self,
        request: &GenerateTopicsRequest,
    ) -> Result<GenerateTopicsResponse> {
        let params = serde_json::to_value(request)?;
        let req = request.clone();
        self.cached_op(
            "generate_topics",
            params,
            self.config.generate_topics_ttl,
            move |adapter| Box::pin(async move { adapter.generate_topics(&req).await }),
        )
        .await
    }

    pub async fn optimize_content(
        &self,
        request: &OptimizeContentRequest,
    ) -> Result<OptimizeContentResponse> {
        let params = serde_json::to_value(request)?;
        let req = request.clone();
        self.cached_op(
            "optimize_content",
            params,
            self.config.optimize_content_ttl,
            move |adapter| Box::pin(async move { adapter.optimize_content(&req).await }),
        )
        .await
    }

    /// Conversational turns are unique; chat always bypasses the cache.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let req = request.clone();
        self.dispatch("chat", move |adapter| {
            Box::pin(async move { adapter.chat(&req).await })
        })
        .await
    }

    // ---- dispatch core -----------------------------------------------------

    /// Cache-then-dispatch: hit short-circuits with no dispatch; miss
    /// dispatches and, only on success, writes through with the
    /// operation's TTL. Cache writes are best-effort.
    async fn cached_op<T, F>(
        &self,
        operation: &'static str,
        params: serde_json::Value,
        op_ttl: Duration,
        run: F,
    ) -> Result<T>
    where
        T: OrchestratedResponse + Serialize + DeserializeOwned,
        F: FnOnce(Arc<dyn BackendAdapter>) -> BoxFuture<'static, Result<T>>,
    {
        let key = fingerprint(&self.config.namespace, operation, &params);
        if let Some(mut hit) = self.cache.get::<T>(&key) {
            self.metrics
                .record_cache_hit(hit.metadata().service_id.clone(), operation);
            hit.metadata_mut().cached = true;
            return Ok(hit);
        }
        self.metrics.record_cache_miss(operation);

        let (response, descriptor) = self.dispatch_inner(operation, run).await?;
        if descriptor.config.cache.enabled {
            let ttl = descriptor.config.cache.ttl.unwrap_or(op_ttl);
            if let Err(err) = self.cache.set_with_ttl(&key, &response, ttl) {
                tracing::warn!(operation, "cache write failed: {err}");
            }
        }
        Ok(response)
    }

    async fn dispatch<T, F>(&self, operation: &'static str, run: F) -> Result<T>
    where
        T: OrchestratedResponse,
        F: FnOnce(Arc<dyn BackendAdapter>) -> BoxFuture<'static, Result<T>>,
    {
        self.dispatch_inner(operation, run).await.map(|(r, _)| r)
    }

    /// Select → rate-limit → breaker-wrapped, timeout-bounded call →
    /// bookkeeping. Locks are held only for bookkeeping; the backend call
    /// itself runs outside all of them.
    async fn dispatch_inner<T, F>(
        &self,
        operation: &'static str,
        run: F,
    ) -> Result<(T, ServiceDescriptor)>
    where
        T: OrchestratedResponse,
        F: FnOnce(Arc<dyn BackendAdapter>) -> BoxFuture<'static, Result<T>>,
    {
        let descriptor = self.balancer.select()?;
        let runtime = self.runtime_of(&descriptor.id)?;

        if let Some(ref limiter) = runtime.limiter {
            limiter.acquire().await;
        }

        let guard = self.balancer.begin_dispatch(&descriptor.id);
        let timeout = descriptor.config.timeout;
        let service_id = descriptor.id.clone();
        let adapter = Arc::clone(&runtime.adapter);
        let started = Instant::now();

        let result = runtime
            .breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, run(adapter)).await {
                    Ok(result) => result,
                    // A timeout counts as a failure even though the
                    // underlying call may still be running.
                    Err(_) => Err(Error::Timeout {
                        service_id: service_id.clone(),
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await;
        let duration = started.elapsed();
        drop(guard);

        match result {
            Ok(mut response) => {
                self.metrics.record_request(
                    &descriptor.id,
                    operation,
                    duration,
                    true,
                    Some(response.usage()),
                    response.metadata().cost,
                );
                self.refresh_registry_metrics(&descriptor.id);

                let meta = response.metadata_mut();
                meta.service_id = descriptor.id.clone();
                meta.duration_ms = duration.as_millis() as u64;
                meta.cached = false;
                meta.request_id = Some(uuid::Uuid::new_v4().to_string());
                Ok((response, descriptor))
            }
            Err(err) => {
                if err.is_fail_fast() {
                    // An open circuit rejected before the backend was
                    // touched. The rejection still counts toward the
                    // service's request volume, but it says nothing new
                    // about backend health.
                    self.metrics.record_error(&descriptor.id, operation);
                } else {
                    tracing::warn!(service = %descriptor.id, operation, "dispatch failed: {err}");
                    self.metrics
                        .record_request(&descriptor.id, operation, duration, false, None, 0.0);
                    self.refresh_registry_metrics(&descriptor.id);
                    self.degrade_after_failure(&descriptor.id, &err);
                }
                Err(err)
            }
        }
    }

    fn runtimes_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServiceRuntime>> {
        match self.runtimes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn runtimes_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServiceRuntime>> {
        match self.runtimes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn runtime_of(&self, id: &str) -> Result<ServiceRuntime> {
        let runtimes = self.runtimes_read();
        runtimes
            .get(id)
            .map(|r| ServiceRuntime {
                adapter: Arc::clone(&r.adapter),
                breaker: Arc::clone(&r.breaker),
                limiter: r.limiter.clone(),
            })
            .ok_or_else(|| Error::UnknownService { id: id.to_string() })
    }

    /// Push a fresh metrics snapshot into the registry so fastest-response
    /// selection sees it on the very next call. Best-effort.
    fn refresh_registry_metrics(&self, id: &str) {
        let snapshot = self.metrics.snapshot(&MetricsFilter::for_service(id));
        if let Err(err) = self.registry.update_metrics(id, snapshot) {
            tracing::debug!(id, "metrics refresh skipped: {err}");
        }
    }

    /// An observed dispatch failure degrades the service immediately. The
    /// service stays selectable so its circuit breaker can keep answering
    /// with a fail-fast; only a health probe marks it unhealthy.
    fn degrade_after_failure(&self, id: &str, err: &Error) {
        let error_rate = self
            .metrics
            .snapshot(&MetricsFilter::for_service(id))
            .error_rate
            * 100.0;
        let status = HealthStatus::with_state(HealthState::Degraded)
            .with_error_rate(error_rate)
            .with_detail("last_error", err.to_string());
        if let Err(err) = self.registry.update_health(id, status) {
            tracing::debug!(id, "health update skipped: {err}");
        }
    }

    // ---- health-check loop -------------------------------------------------

    /// Probe every registered adapter once and fold the results into the
    /// registry, then run the metrics retention sweep.
    pub async fn run_health_check_cycle(&self) {
        for descriptor in self.registry.all() {
            let Ok(runtime) = self.runtime_of(&descriptor.id) else {
                continue;
            };
            let probe_started = Instant::now();
            let outcome =
                tokio::time::timeout(self.config.health_probe_timeout, runtime.adapter.health_check())
                    .await;
            let error_rate = self
                .metrics
                .snapshot(&MetricsFilter::for_service(&descriptor.id))
                .error_rate
                * 100.0;

            let status = match outcome {
                Ok(Ok(probe)) => {
                    let mut status = HealthStatus::with_state(probe.state)
                        .with_response_time(probe.response_time)
                        .with_error_rate(error_rate);
                    if let Some(message) = probe.message {
                        status = status.with_detail("probe", message);
                    }
                    status
                }
                Ok(Err(err)) => HealthStatus::with_state(HealthState::Unhealthy)
                    .with_response_time(probe_started.elapsed())
                    .with_error_rate(error_rate)
                    .with_detail("probe_error", err.to_string()),
                Err(_) => HealthStatus::with_state(HealthState::Unhealthy)
                    .with_response_time(probe_started.elapsed())
                    .with_error_rate(error_rate)
                    .with_detail("probe_error", "health probe timed out"),
            };
            if self.registry.update_health(&descriptor.id, status).is_err() {
                // Unregistered mid-cycle.
                continue;
            }
            self.refresh_registry_metrics(&descriptor.id);
        }
        let purged = self.metrics.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "metric records purged by retention sweep");
        }
    }

    /// Start the periodic health-check loop. Idempotent; a second call while
    /// running is a no-op.
    pub fn start_health_loop(self: &Arc<Self>) {
        let mut task = self.health_task_lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let orchestrator = Arc::clone(self);
        let interval = self.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the interval's immediate first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.run_health_check_cycle().await;
            }
        }));
        tracing::info!(interval_ms = interval.as_millis() as u64, "health loop started");
    }

    /// Stop the health-check loop. Idempotent.
    pub fn stop_health_loop(&self) {
        if let Some(task) = self.health_task_lock().take() {
            task.abort();
            tracing::info!("health loop stopped");
        }
    }

    fn health_task_lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.health_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_health_loop();
    }
}
