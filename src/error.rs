use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "config.circuit.failure_threshold")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "service_registry", "circuit_breaker")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the orchestration layer.
///
/// This aggregates all failure modes of the dispatch path into actionable,
/// high-level categories. Dispatch failures propagate to the caller unchanged
/// after health and circuit bookkeeping; they are never retried here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_issues(.issues))]
    Configuration {
        message: String,
        /// Structured list of individual validation failures.
        issues: Vec<String>,
    },

    #[error("Service '{id}' is already registered")]
    DuplicateService { id: String },

    #[error("Service '{id}' is not registered")]
    UnknownService { id: String },

    #[error("No available service: {message}")]
    NoAvailableService { message: String },

    #[error("Circuit open for service '{service_id}', retry in {retry_in_ms}ms")]
    CircuitOpen { service_id: String, retry_in_ms: u64 },

    #[error("Backend error from service '{service_id}': {message}{}", format_context(.context))]
    Backend {
        service_id: String,
        message: String,
        context: ErrorContext,
    },

    #[error("Dispatch to service '{service_id}' timed out after {elapsed_ms}ms")]
    Timeout { service_id: String, elapsed_ms: u64 },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_issues(issues: &[String]) -> String {
    if issues.is_empty() {
        String::new()
    } else {
        format!(" [{}]", issues.join("; "))
    }
}

impl Error {
    /// Create a configuration error from a structured issue list.
    pub fn configuration(msg: impl Into<String>, issues: Vec<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            issues,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a backend error attributed to a specific service.
    pub fn backend(service_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Backend {
            service_id: service_id.into(),
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn no_available_service(msg: impl Into<String>) -> Self {
        Error::NoAvailableService {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Backend { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether this error means the backend was never invoked (fail-fast paths).
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. } | Error::NoAvailableService { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_issues() {
        let err = Error::configuration(
            "invalid service config",
            vec!["name must not be empty".into(), "timeout must be > 0".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("name must not be empty"));
        assert!(msg.contains("timeout must be > 0"));
    }

    #[test]
    fn test_backend_error_context() {
        let err = Error::Backend {
            service_id: "svc-1".into(),
            message: "upstream 500".into(),
            context: ErrorContext::new().with_source("dispatch"),
        };
        assert!(err.to_string().contains("source: dispatch"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_fail_fast_classification() {
        assert!(Error::no_available_service("empty healthy set").is_fail_fast());
        assert!(Error::CircuitOpen {
            service_id: "svc-1".into(),
            retry_in_ms: 500
        }
        .is_fail_fast());
        assert!(!Error::backend("svc-1", "boom").is_fail_fast());
    }
}
