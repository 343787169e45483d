//! 服务描述模块：后端服务的配置、描述符与健康状态。
//!
//! # Service Module
//!
//! Configuration and descriptor types for registered backend services, plus
//! the health classification read by the load balancer.
//!
//! A [`ServiceConfig`] is validated up front: registration is rejected with a
//! structured issue list before anything is constructed from it. The
//! [`ServiceDescriptor`] is the registry-owned view of a validated config.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Health classification of a backend service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Live health snapshot of a service.
///
/// Updated atomically as a whole by the health-check loop or by an observed
/// dispatch failure; the load balancer never sees a partially-updated status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub last_checked: SystemTime,
    /// Most recent probe or dispatch response time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<Duration>,
    /// Error rate in percent over the recent metrics window.
    pub error_rate: f64,
    /// Free-form detail map (probe messages, failure reasons).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self::with_state(HealthState::Healthy)
    }

    pub fn with_state(state: HealthState) -> Self {
        Self {
            state,
            last_checked: SystemTime::now(),
            response_time: None,
            error_rate: 0.0,
            details: HashMap::new(),
        }
    }

    pub fn with_response_time(mut self, rt: Duration) -> Self {
        self.response_time = Some(rt);
        self
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Circuit breaker thresholds carried in a service config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Failure percentage over the monitoring window that opens the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Rolling window over which the failure rate is computed.
    pub monitoring_window: Duration,
    /// Minimum outcomes in the window before the threshold can trip.
    pub min_samples: u32,
    /// Consecutive successes in HALF_OPEN required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 50,
            recovery_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
            min_samples: 5,
            success_threshold: 3,
        }
    }
}

/// Cache behavior for one service's cacheable operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub enabled: bool,
    /// Per-service TTL override; falls back to the orchestrator default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: None,
        }
    }
}

/// Retry policy carried for the adapter's benefit.
///
/// The orchestrator never retries; this is forwarded to the adapter via
/// `update_config` and drives the adapter's own retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
        }
    }
}

/// Full capability configuration for one backend service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique id; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Provider kind tag used for `by_kind` lookups (e.g. "openai", "local").
    pub kind: String,
    /// Credential handed to the adapter. `None` produces a warning (some
    /// backends are local); an empty string is always a validation error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Requests per second; `None` disables rate limiting for this service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<f64>,
    /// Relative weight for weighted selection. Zero means "never pick me".
    pub weight: u32,
    #[serde(default)]
    pub circuit: CircuitBreakerSettings,
    #[serde(default)]
    pub cache: CachePolicy,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: kind.into(),
            credential: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            rate_limit: None,
            weight: 1,
            circuit: CircuitBreakerSettings::default(),
            cache: CachePolicy::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, rps: f64) -> Self {
        self.rate_limit = Some(rps);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitBreakerSettings) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Validate the config before registration.
    ///
    /// Returns the non-fatal warnings on success; fails with a
    /// [`Error::Configuration`] carrying every hard issue found, in which
    /// case nothing must be registered.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.kind.trim().is_empty() {
            errors.push("kind must not be empty".to_string());
        }
        match &self.credential {
            Some(c) if c.trim().is_empty() => {
                errors.push("credential must not be an empty string".to_string());
            }
            None => warnings.push("no credential configured".to_string()),
            _ => {}
        }
        if self.timeout.is_zero() {
            errors.push("timeout must be greater than zero".to_string());
        } else if self.timeout < Duration::from_millis(100) {
            warnings.push(format!(
                "timeout of {}ms is unusually low",
                self.timeout.as_millis()
            ));
        }
        if let Some(rps) = self.rate_limit {
            if !rps.is_finite() || rps <= 0.0 {
                errors.push(format!("rate_limit must be a positive number, got {rps}"));
            }
        }
        if self.weight == 0 {
            warnings.push("weight is 0; service is excluded from weighted selection".to_string());
        }
        if self.circuit.failure_threshold == 0 || self.circuit.failure_threshold > 100 {
            errors.push(format!(
                "circuit.failure_threshold must be within 1..=100, got {}",
                self.circuit.failure_threshold
            ));
        }
        if self.circuit.recovery_timeout.is_zero() {
            errors.push("circuit.recovery_timeout must be greater than zero".to_string());
        }
        if self.circuit.monitoring_window.is_zero() {
            errors.push("circuit.monitoring_window must be greater than zero".to_string());
        }
        if self.circuit.min_samples == 0 {
            errors.push("circuit.min_samples must be at least 1".to_string());
        }
        if self.circuit.success_threshold == 0 {
            errors.push("circuit.success_threshold must be at least 1".to_string());
        }

        if errors.is_empty() {
            for w in &warnings {
                tracing::warn!(service = %self.name, "config warning: {w}");
            }
            Ok(warnings)
        } else {
            Err(Error::configuration(
                format!("invalid config for service '{}'", self.name),
                errors,
            ))
        }
    }
}

/// Registry-owned view of a registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: String,
    /// Administratively enabled. Disabled services receive no traffic.
    pub active: bool,
    pub config: ServiceConfig,
}

impl ServiceDescriptor {
    /// Build a descriptor from a validated config, generating an id if the
    /// config does not carry one.
    pub fn from_config(config: ServiceConfig) -> Self {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.kind, uuid::Uuid::new_v4()));
        Self {
            id,
            name: config.name.clone(),
            kind: config.kind.clone(),
            active: true,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_passes_with_warnings() {
        let config = ServiceConfig::new("primary", "openai").with_weight(0);
        let warnings = config.validate().expect("config should be valid");
        // no credential + zero weight
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_empty_credential_rejected() {
        let config = ServiceConfig::new("primary", "openai").with_credential("");
        let err = config.validate().unwrap_err();
        match err {
            Error::Configuration { issues, .. } => {
                assert!(issues.iter().any(|i| i.contains("credential")));
            }
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = ServiceConfig::new("primary", "openai").with_credential("key");
        config.circuit.failure_threshold = 150;
        assert!(config.validate().is_err());

        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());

        config.circuit.failure_threshold = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_all_errors_collected() {
        let mut config = ServiceConfig::new("", "").with_credential("");
        config.timeout = Duration::ZERO;
        config.rate_limit = Some(-1.0);
        let err = config.validate().unwrap_err();
        match err {
            Error::Configuration { issues, .. } => assert!(issues.len() >= 5),
            other => panic!("expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_id_generation() {
        let explicit = ServiceDescriptor::from_config(
            ServiceConfig::new("primary", "openai").with_id("svc-1"),
        );
        assert_eq!(explicit.id, "svc-1");

        let generated = ServiceDescriptor::from_config(ServiceConfig::new("primary", "openai"));
        assert!(generated.id.starts_with("openai-"));
    }
}
