//! 服务注册表模块：已注册后端的权威映射与健康/指标快照。
//!
//! # Service Registry Module
//!
//! The [`ServiceRegistry`] is the authoritative map of registered backend
//! descriptors plus their live health and metrics snapshots. It is the only
//! owner of [`ServiceDescriptor`]s; everything else reads through it.
//!
//! Entries are kept in registration order; that order is the load
//! balancer's round-robin order and its tie-break rule, so it must be
//! stable across reads.
//!
//! Registration, unregistration and health changes are announced to
//! registered [`RegistryObserver`]s. Notification happens after the write
//! lock is released, so observers may freely read the registry back.

use crate::metrics::ServiceMetricsSnapshot;
use crate::service::{HealthState, HealthStatus, ServiceDescriptor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// State-change notification emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(ServiceDescriptor),
    Unregistered { id: String },
    HealthChanged {
        id: String,
        previous: HealthState,
        current: HealthState,
    },
}

/// Explicit observer interface for registry events.
///
/// Implementations must be cheap and non-blocking; they run on the caller's
/// thread right after the mutation.
pub trait RegistryObserver: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    health: HealthStatus,
    metrics: Option<ServiceMetricsSnapshot>,
}

/// Aggregate view computed fresh from the live descriptor set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub active: usize,
    pub healthy: usize,
    /// Request-weighted error rate across all services, ratio in `0.0..=1.0`.
    pub overall_error_rate: f64,
    pub by_kind: HashMap<String, usize>,
    pub by_state: HashMap<String, usize>,
}

/// Authoritative map of registered backends.
pub struct ServiceRegistry {
    entries: RwLock<Vec<ServiceEntry>>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.push(observer);
    }

    fn notify(&self, event: RegistryEvent) {
        let observers: Vec<_> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer.on_event(&event);
        }
    }

    // Lock poisoning only happens when a holder panicked mid-update; the
    // entry list itself is always structurally valid, so recover the guard.
    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<ServiceEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, Vec<ServiceEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new service. New services start healthy; the first probe
    /// or dispatch corrects that if needed.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        {
            let mut entries = self.write_entries();
            if entries.iter().any(|e| e.descriptor.id == descriptor.id) {
                return Err(Error::DuplicateService {
                    id: descriptor.id.clone(),
                });
            }
            entries.push(ServiceEntry {
                descriptor: descriptor.clone(),
                health: HealthStatus::healthy(),
                metrics: None,
            });
        }
        tracing::info!(id = %descriptor.id, name = %descriptor.name, "service registered");
        self.notify(RegistryEvent::Registered(descriptor));
        Ok(())
    }

    /// Remove a service. Idempotent; returns whether anything was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut entries = self.write_entries();
            let before = entries.len();
            entries.retain(|e| e.descriptor.id != id);
            entries.len() < before
        };
        if removed {
            tracing::info!(id = %id, "service unregistered");
            self.notify(RegistryEvent::Unregistered { id: id.to_string() });
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_entries()
            .iter()
            .any(|e| e.descriptor.id == id)
    }

    pub fn get(&self, id: &str) -> Option<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.descriptor.clone())
    }

    /// All descriptors in registration order.
    pub fn all(&self) -> Vec<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn by_kind(&self, kind: &str) -> Vec<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .filter(|e| e.descriptor.kind == kind)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Services currently classified strictly healthy.
    pub fn healthy(&self) -> Vec<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .filter(|e| e.health.state == HealthState::Healthy)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Administratively active services.
    pub fn active(&self) -> Vec<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .filter(|e| e.descriptor.active)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// The set the load balancer draws from: active and not unhealthy.
    /// Degraded services keep receiving traffic; unhealthy ones get zero
    /// probability regardless of algorithm.
    pub fn selectable(&self) -> Vec<ServiceDescriptor> {
        self.read_entries()
            .iter()
            .filter(|e| e.descriptor.active && e.health.state != HealthState::Unhealthy)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn health_of(&self, id: &str) -> Option<HealthStatus> {
        self.read_entries()
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| e.health.clone())
    }

    pub fn metrics_of(&self, id: &str) -> Option<ServiceMetricsSnapshot> {
        self.read_entries()
            .iter()
            .find(|e| e.descriptor.id == id)
            .and_then(|e| e.metrics.clone())
    }

    /// Replace a service's health status as a whole. The status swap is
    /// atomic under the write lock; concurrent readers see either the old or
    /// the new status, never a mix.
    pub fn update_health(&self, id: &str, status: HealthStatus) -> Result<()> {
        let previous = {
            let mut entries = self.write_entries();
            let entry = entries
                .iter_mut()
                .find(|e| e.descriptor.id == id)
                .ok_or_else(|| Error::UnknownService { id: id.to_string() })?;
            let previous = entry.health.state;
            entry.health = status.clone();
            previous
        };
        if previous != status.state {
            tracing::debug!(id = %id, from = %previous, to = %status.state, "health changed");
            self.notify(RegistryEvent::HealthChanged {
                id: id.to_string(),
                previous,
                current: status.state,
            });
        }
        Ok(())
    }

    /// Replace a service's cached metrics snapshot.
    pub fn update_metrics(&self, id: &str, snapshot: ServiceMetricsSnapshot) -> Result<()> {
        let mut entries = self.write_entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.descriptor.id == id)
            .ok_or_else(|| Error::UnknownService { id: id.to_string() })?;
        entry.metrics = Some(snapshot);
        Ok(())
    }

    /// Replace a service's configuration in place. The id is fixed at
    /// registration; the descriptor's name and kind follow the new config.
    pub fn update_config(&self, id: &str, config: crate::service::ServiceConfig) -> Result<()> {
        let mut entries = self.write_entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.descriptor.id == id)
            .ok_or_else(|| Error::UnknownService { id: id.to_string() })?;
        entry.descriptor.name = config.name.clone();
        entry.descriptor.kind = config.kind.clone();
        entry.descriptor.config = config;
        Ok(())
    }

    /// Set the administrative active flag.
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut entries = self.write_entries();
        let entry = entries
            .iter_mut()
            .find(|e| e.descriptor.id == id)
            .ok_or_else(|| Error::UnknownService { id: id.to_string() })?;
        entry.descriptor.active = active;
        Ok(())
    }

    /// Fresh O(n) aggregate over the live descriptor set.
    pub fn statistics(&self) -> RegistryStatistics {
        let entries = self.read_entries();
        let mut stats = RegistryStatistics {
            total: entries.len(),
            ..Default::default()
        };
        let mut weighted_errors = 0.0;
        let mut total_requests = 0u64;

        for entry in entries.iter() {
            if entry.descriptor.active {
                stats.active += 1;
            }
            if entry.health.state == HealthState::Healthy {
                stats.healthy += 1;
            }
            *stats
                .by_kind
                .entry(entry.descriptor.kind.clone())
                .or_insert(0) += 1;
            *stats
                .by_state
                .entry(entry.health.state.to_string())
                .or_insert(0) += 1;
            if let Some(ref m) = entry.metrics {
                weighted_errors += m.error_rate * m.request_count as f64;
                total_requests += m.request_count;
            }
        }
        if total_requests > 0 {
            stats.overall_error_rate = weighted_errors / total_requests as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
