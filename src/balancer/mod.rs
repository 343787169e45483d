//! 负载均衡模块：在健康后端集合上执行可配置的选择算法。
//!
//! # Load Balancer Module
//!
//! Stateless selection logic over the registry's selectable set. Every
//! [`LoadBalancer::select`] call reads the registry live, so a health update
//! pushed after a dispatch is visible to the very next selection.
//!
//! The only state the balancer owns is bookkeeping: the round-robin cursor
//! and the per-service in-flight counters backing least-connections. The
//! counters are maintained through RAII guards handed out at dispatch start
//! and released on completion, successful or not.
//!
//! Tie-break rule across all algorithms: registration order wins.

use crate::registry::ServiceRegistry;
use crate::service::ServiceDescriptor;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Selection algorithm, chosen by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionAlgorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
    FastestResponse,
    Random,
}

impl FromStr for SelectionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least-connections" => Ok(Self::LeastConnections),
            "fastest-response" => Ok(Self::FastestResponse),
            "random" => Ok(Self::Random),
            other => Err(Error::configuration(
                "unknown load balancing algorithm",
                vec![format!(
                    "'{other}' is not one of round-robin, weighted, least-connections, \
                     fastest-response, random"
                )],
            )),
        }
    }
}

/// RAII in-flight marker. Incremented at dispatch start, decremented on drop.
pub struct InFlightGuard {
    service_id: String,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = counts.get_mut(&self.service_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.service_id);
            }
        }
    }
}

/// Picks one backend from the registry's selectable set per request.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    algorithm: SelectionAlgorithm,
    cursor: AtomicUsize,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, algorithm: SelectionAlgorithm) -> Self {
        Self {
            registry,
            algorithm,
            cursor: AtomicUsize::new(0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn algorithm(&self) -> SelectionAlgorithm {
        self.algorithm
    }

    /// Select a backend for one request.
    ///
    /// Fails with [`Error::NoAvailableService`] when the selectable set is
    /// empty, or when weighted selection finds only zero-weight candidates.
    pub fn select(&self) -> Result<ServiceDescriptor> {
        let candidates = self.registry.selectable();
        if candidates.is_empty() {
            return Err(Error::no_available_service(
                "no healthy services are registered",
            ));
        }

        match self.algorithm {
            SelectionAlgorithm::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Ok(candidates[idx].clone())
            }
            SelectionAlgorithm::Weighted => self.select_weighted(&candidates),
            SelectionAlgorithm::LeastConnections => {
                let counts = match self.in_flight.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let chosen = candidates
                    .iter()
                    .min_by_key(|d| counts.get(&d.id).copied().unwrap_or(0))
                    .cloned();
                // min_by_key keeps the first minimum: registration order tie-break.
                Ok(chosen.expect("candidates verified non-empty"))
            }
            SelectionAlgorithm::FastestResponse => {
                let mut best: Option<(&ServiceDescriptor, f64)> = None;
                for candidate in &candidates {
                    // No recorded latency counts as 0ms: fresh services get tried first.
                    let latency = self
                        .registry
                        .metrics_of(&candidate.id)
                        .map(|m| m.avg_latency_ms)
                        .unwrap_or(0.0);
                    match best {
                        Some((_, current)) if latency >= current => {}
                        _ => best = Some((candidate, latency)),
                    }
                }
                Ok(best.expect("candidates verified non-empty").0.clone())
            }
            SelectionAlgorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Ok(candidates[idx].clone())
            }
        }
    }

    fn select_weighted(&self, candidates: &[ServiceDescriptor]) -> Result<ServiceDescriptor> {
        let total: u64 = candidates.iter().map(|d| u64::from(d.config.weight)).sum();
        if total == 0 {
            return Err(Error::no_available_service(
                "all healthy services have weight 0",
            ));
        }
        let mut ticket = rand::thread_rng().gen_range(0..total);
        for candidate in candidates {
            let weight = u64::from(candidate.config.weight);
            if ticket < weight {
                return Ok(candidate.clone());
            }
            ticket -= weight;
        }
        // Unreachable: total covers every ticket value.
        Ok(candidates[candidates.len() - 1].clone())
    }

    /// Mark a dispatch as started. Dropping the guard marks it complete.
    pub fn begin_dispatch(&self, service_id: impl Into<String>) -> InFlightGuard {
        let service_id = service_id.into();
        {
            let mut counts = match self.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *counts.entry(service_id.clone()).or_insert(0) += 1;
        }
        InFlightGuard {
            service_id,
            counts: Arc::clone(&self.in_flight),
        }
    }

    /// Current in-flight count for a service.
    pub fn in_flight_of(&self, service_id: &str) -> usize {
        self.in_flight
            .lock()
            .map(|counts| counts.get(service_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServiceMetricsSnapshot;
    use crate::service::{HealthState, HealthStatus, ServiceConfig, ServiceDescriptor};
    use std::collections::HashSet;

    fn registry_with(services: &[(&str, u32)]) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        for (id, weight) in services {
            let descriptor = ServiceDescriptor::from_config(
                ServiceConfig::new(*id, "mock").with_id(*id).with_weight(*weight),
            );
            registry.register(descriptor).unwrap();
        }
        registry
    }

    #[test]
    fn test_round_robin_fairness() {
        let registry = registry_with(&[("a", 1), ("b", 1), ("c", 1)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::RoundRobin);

        let picks: HashSet<String> = (0..3).map(|_| balancer.select().unwrap().id).collect();
        assert_eq!(picks.len(), 3, "3 consecutive calls must visit 3 distinct services");

        // Next cycle repeats in the same stable order.
        assert_eq!(balancer.select().unwrap().id, "a");
    }

    #[test]
    fn test_empty_set_fails() {
        let registry = Arc::new(ServiceRegistry::new());
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::RoundRobin);
        assert!(matches!(
            balancer.select().unwrap_err(),
            Error::NoAvailableService { .. }
        ));
    }

    #[test]
    fn test_unhealthy_excluded_from_every_algorithm() {
        for algorithm in [
            SelectionAlgorithm::RoundRobin,
            SelectionAlgorithm::Weighted,
            SelectionAlgorithm::LeastConnections,
            SelectionAlgorithm::FastestResponse,
            SelectionAlgorithm::Random,
        ] {
            let registry = registry_with(&[("up", 1), ("down", 100)]);
            registry
                .update_health("down", HealthStatus::with_state(HealthState::Unhealthy))
                .unwrap();
            let balancer = LoadBalancer::new(registry, algorithm);
            for _ in 0..20 {
                assert_eq!(balancer.select().unwrap().id, "up", "{algorithm:?}");
            }
        }
    }

    #[test]
    fn test_weighted_distribution() {
        let registry = registry_with(&[("a", 70), ("b", 20), ("c", 10)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::Weighted);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            *counts.entry(balancer.select().unwrap().id).or_insert(0) += 1;
        }
        let a = counts["a"];
        let b = counts["b"];
        let c = counts["c"];
        assert!((600..800).contains(&a), "a={a}");
        assert!((130..280).contains(&b), "b={b}");
        assert!((40..180).contains(&c), "c={c}");
    }

    #[test]
    fn test_weight_zero_never_selected() {
        let registry = registry_with(&[("weighted", 5), ("zero", 0)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::Weighted);
        for _ in 0..100 {
            assert_eq!(balancer.select().unwrap().id, "weighted");
        }
    }

    #[test]
    fn test_all_zero_weights_is_no_available_service() {
        let registry = registry_with(&[("a", 0), ("b", 0)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::Weighted);
        assert!(matches!(
            balancer.select().unwrap_err(),
            Error::NoAvailableService { .. }
        ));
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let registry = registry_with(&[("a", 1), ("b", 1)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::LeastConnections);

        // Tie: registration order wins.
        assert_eq!(balancer.select().unwrap().id, "a");

        let _guard_a = balancer.begin_dispatch("a");
        assert_eq!(balancer.in_flight_of("a"), 1);
        assert_eq!(balancer.select().unwrap().id, "b");

        let _guard_b1 = balancer.begin_dispatch("b");
        let _guard_b2 = balancer.begin_dispatch("b");
        assert_eq!(balancer.select().unwrap().id, "a");
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let registry = registry_with(&[("a", 1)]);
        let balancer = LoadBalancer::new(registry, SelectionAlgorithm::LeastConnections);
        {
            let _guard = balancer.begin_dispatch("a");
            assert_eq!(balancer.in_flight_of("a"), 1);
        }
        assert_eq!(balancer.in_flight_of("a"), 0);
    }

    #[test]
    fn test_fastest_response_uses_registry_snapshot() {
        let registry = registry_with(&[("slow", 1), ("fast", 1)]);
        registry
            .update_metrics(
                "slow",
                ServiceMetricsSnapshot {
                    avg_latency_ms: 250.0,
                    ..Default::default()
                },
            )
            .unwrap();
        registry
            .update_metrics(
                "fast",
                ServiceMetricsSnapshot {
                    avg_latency_ms: 40.0,
                    ..Default::default()
                },
            )
            .unwrap();

        let balancer = LoadBalancer::new(Arc::clone(&registry), SelectionAlgorithm::FastestResponse);
        assert_eq!(balancer.select().unwrap().id, "fast");

        // A fresh service without samples counts as 0ms and wins.
        let fresh = ServiceDescriptor::from_config(
            ServiceConfig::new("fresh", "mock").with_id("fresh"),
        );
        registry.register(fresh).unwrap();
        assert_eq!(balancer.select().unwrap().id, "fresh");
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "least-connections".parse::<SelectionAlgorithm>().unwrap(),
            SelectionAlgorithm::LeastConnections
        );
        let err = "fastest".parse::<SelectionAlgorithm>().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
