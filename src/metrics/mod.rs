//! 指标采集模块：按调用记录遥测并按需聚合。
//!
//! # Metrics Module
//!
//! The [`MetricsCollector`] ingests one immutable [`MetricRecord`] per call
//! and derives [`ServiceMetricsSnapshot`]s on demand. Nothing is
//! pre-aggregated: percentiles and rates are computed over the filtered
//! record set at query time, so a snapshot always reflects exactly the
//! retained records.
//!
//! Retention is bounded two ways:
//! - an absolute record cap, enforced oldest-first on every insert
//! - an age window, enforced by [`MetricsCollector::purge_expired`] which the
//!   orchestrator's health loop calls periodically
//!
//! Recording is best-effort from the caller's point of view: the orchestrator
//! logs and ignores recording failures rather than failing a dispatch.

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Immutable per-call fact.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub timestamp: Instant,
    pub service_id: String,
    pub operation: String,
    pub duration: Duration,
    pub success: bool,
    pub usage: Option<TokenUsage>,
    pub cost: f64,
    /// True when the call was served from the orchestrator cache.
    pub cached: bool,
}

/// Filter for on-demand aggregation. Empty filter matches every record.
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub service_id: Option<String>,
    pub operation: Option<String>,
    /// Only records younger than this window.
    pub window: Option<Duration>,
}

impl MetricsFilter {
    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, record: &MetricRecord, now: Instant) -> bool {
        if let Some(ref id) = self.service_id {
            if record.service_id != *id {
                return false;
            }
        }
        if let Some(ref op) = self.operation {
            if record.operation != *op {
                return false;
            }
        }
        if let Some(window) = self.window {
            if now.duration_since(record.timestamp) > window {
                return false;
            }
        }
        true
    }
}

/// Aggregated view over a set of records. Derived, never mutated directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceMetricsSnapshot {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// `error_count / request_count`, as a ratio in `0.0..=1.0`.
    pub error_rate: f64,
    /// Latency statistics over non-cached dispatches only; cache hits are
    /// near-instant and would drown the backend signal.
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Calls served from the orchestrator cache (within the filter).
    pub cache_hits: u64,
    /// Orchestrator-wide cache misses; a miss happens before service
    /// selection and is not attributable to one service.
    pub cache_misses: u64,
    /// `success_count / request_count`, in percent.
    pub availability: f64,
}

/// Which metric a ranking is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMetric {
    /// Ascending: lowest error rate first.
    ErrorRate,
    /// Ascending: lowest average latency first.
    Latency,
    /// Descending: most requests first.
    RequestCount,
    /// Descending: highest cost first.
    Cost,
}

/// One entry of a service ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRanking {
    pub service_id: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct MetricsCollectorConfig {
    /// Records older than this are dropped by the retention sweep.
    pub retention: Duration,
    /// Absolute record cap; oldest records are evicted first.
    pub max_records: usize,
}

impl Default for MetricsCollectorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_records: 10_000,
        }
    }
}

/// Ingests per-call telemetry and aggregates it on demand.
pub struct MetricsCollector {
    config: MetricsCollectorConfig,
    records: Mutex<VecDeque<MetricRecord>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl MetricsCollector {
    pub fn new(config: MetricsCollectorConfig) -> Self {
        Self {
            config,
            records: Mutex::new(VecDeque::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Record one completed dispatch.
    #[allow(clippy::too_many_arguments)]
    pub fn record_request(
        &self,
        service_id: impl Into<String>,
        operation: impl Into<String>,
        duration: Duration,
        success: bool,
        usage: Option<TokenUsage>,
        cost: f64,
    ) {
        self.push(MetricRecord {
            timestamp: Instant::now(),
            service_id: service_id.into(),
            operation: operation.into(),
            duration,
            success,
            usage,
            cost,
            cached: false,
        });
    }

    /// Record a failure that never produced a response (fail-fast paths).
    pub fn record_error(&self, service_id: impl Into<String>, operation: impl Into<String>) {
        self.record_request(service_id, operation, Duration::ZERO, false, None, 0.0);
    }

    /// Record a cache hit. The hit still counts as a request against the
    /// service that originally produced the cached value.
    pub fn record_cache_hit(&self, service_id: impl Into<String>, operation: impl Into<String>) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.push(MetricRecord {
            timestamp: Instant::now(),
            service_id: service_id.into(),
            operation: operation.into(),
            duration: Duration::ZERO,
            success: true,
            usage: None,
            cost: 0.0,
            cached: true,
        });
    }

    /// Record a cache miss. The dispatch that follows produces its own record.
    pub fn record_cache_miss(&self, _operation: impl Into<String>) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn push(&self, record: MetricRecord) {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while records.len() >= self.config.max_records {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Drop records older than the retention window. Returns the number
    /// removed.
    pub fn purge_expired(&self) -> usize {
        let cutoff = Instant::now();
        let retention = self.config.retention;
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = records.len();
        while let Some(front) = records.front() {
            if cutoff.duration_since(front.timestamp) > retention {
                records.pop_front();
            } else {
                break;
            }
        }
        before - records.len()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Aggregate the records matching `filter` into a snapshot.
    pub fn snapshot(&self, filter: &MetricsFilter) -> ServiceMetricsSnapshot {
        let now = Instant::now();
        let records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut snap = ServiceMetricsSnapshot::default();
        let mut durations: Vec<Duration> = Vec::new();

        for record in records.iter().filter(|r| filter.matches(r, now)) {
            snap.request_count += 1;
            if record.success {
                snap.success_count += 1;
            } else {
                snap.error_count += 1;
            }
            if record.cached {
                snap.cache_hits += 1;
            } else {
                durations.push(record.duration);
            }
            if let Some(usage) = record.usage {
                snap.prompt_tokens += u64::from(usage.prompt_tokens);
                snap.completion_tokens += u64::from(usage.completion_tokens);
                snap.total_tokens += u64::from(usage.total_tokens);
            }
            snap.total_cost += record.cost;
        }
        drop(records);

        snap.cache_misses = self.cache_misses.load(Ordering::Relaxed);

        if snap.request_count > 0 {
            snap.error_rate = snap.error_count as f64 / snap.request_count as f64;
            snap.availability = snap.success_count as f64 / snap.request_count as f64 * 100.0;
        }
        if !durations.is_empty() {
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            snap.avg_latency_ms = total_ms / durations.len() as f64;
            durations.sort_unstable();
            snap.p95_latency_ms = percentile(&durations, 0.95).as_millis() as u64;
            snap.p99_latency_ms = percentile(&durations, 0.99).as_millis() as u64;
        }
        snap
    }

    /// Total cache hit/miss counters across all services.
    pub fn cache_counters(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Rank services by a metric. Error rate and latency sort ascending
    /// (best first); request count and cost sort descending (biggest first).
    pub fn ranking(&self, metric: RankingMetric, limit: usize) -> Vec<ServiceRanking> {
        let mut service_ids: Vec<String> = Vec::new();
        {
            let records = match self.records.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut seen: HashSet<String> = HashSet::new();
            for record in records.iter() {
                if seen.insert(record.service_id.clone()) {
                    service_ids.push(record.service_id.clone());
                }
            }
        }

        let mut entries: Vec<ServiceRanking> = service_ids
            .into_iter()
            .map(|service_id| {
                let snap = self.snapshot(&MetricsFilter::for_service(service_id.clone()));
                let value = match metric {
                    RankingMetric::ErrorRate => snap.error_rate,
                    RankingMetric::Latency => snap.avg_latency_ms,
                    RankingMetric::RequestCount => snap.request_count as f64,
                    RankingMetric::Cost => snap.total_cost,
                };
                ServiceRanking { service_id, value }
            })
            .collect();

        match metric {
            RankingMetric::ErrorRate | RankingMetric::Latency => {
                entries.sort_by(|a, b| a.value.total_cmp(&b.value));
            }
            RankingMetric::RequestCount | RankingMetric::Cost => {
                entries.sort_by(|a, b| b.value.total_cmp(&a.value));
            }
        }
        entries.truncate(limit);
        entries
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsCollectorConfig::default())
    }
}

/// Sort-and-index percentile: `sorted[floor(n * q)]`, clamped to the last
/// element.
fn percentile(sorted: &[Duration], q: f64) -> Duration {
    debug_assert!(!sorted.is_empty());
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}
