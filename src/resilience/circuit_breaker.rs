use crate::service::CircuitBreakerSettings;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage over the monitoring window that opens the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before the first trial call.
    pub recovery_timeout: Duration,
    /// Rolling window over which the failure rate is computed.
    pub monitoring_window: Duration,
    /// Minimum outcomes in the window before the threshold can trip.
    pub min_samples: u32,
    /// Consecutive successes in HALF_OPEN required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
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

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold percentage
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the monitoring window
    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    /// Set the minimum sample count
    pub fn with_min_samples(mut self, min_samples: u32) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Set the consecutive-success threshold for closing
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout,
            monitoring_window: settings.monitoring_window,
            min_samples: settings.min_samples,
            success_threshold: settings.success_threshold,
        }
    }
}

/// Explicit observer for state transitions. Runs on the recording thread
/// with no locks held; implementations must be cheap.
pub trait StateListener: Send + Sync {
    fn on_transition(&self, service_id: &str, from: CircuitState, to: CircuitState);
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
    duration: Duration,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    /// Per-outcome timestamp log bounded by the monitoring window. This is
    /// the source of truth for the failure rate; no approximation.
    outcomes: VecDeque<Outcome>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_failures: u64,
    total_successes: u64,
    next_retry_at: Option<Instant>,
}

impl State {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.outcomes.front() {
            if now.duration_since(front.at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|o| !o.success).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Current breaker observables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Windowed failure rate, ratio in `0.0..=1.0`.
    pub failure_rate: f64,
    pub window_samples: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Response time distribution over the monitoring window, milliseconds.
    pub min_response_ms: u64,
    pub avg_response_ms: f64,
    pub max_response_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

/// Per-service circuit breaker.
///
/// Transitions:
/// - CLOSED → OPEN when the windowed failure rate reaches the threshold
///   (with at least `min_samples` outcomes in the window)
/// - OPEN → HALF_OPEN lazily, on the first call after the recovery deadline
/// - HALF_OPEN → CLOSED after `success_threshold` consecutive successes
/// - HALF_OPEN → OPEN on any single failure
pub struct CircuitBreaker {
    service_id: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
}

impl CircuitBreaker {
    pub fn new(service_id: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            service_id: service_id.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_failures: 0,
                total_successes: 0,
                next_retry_at: None,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(listener);
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(
            service = %self.service_id,
            from = %from,
            to = %to,
            "circuit state changed"
        );
        let listeners: Vec<_> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener.on_transition(&self.service_id, from, to);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check whether a call may proceed right now.
    ///
    /// While OPEN before the recovery deadline this fails with
    /// [`Error::CircuitOpen`]; at or past the deadline the breaker moves to
    /// HALF_OPEN and the call is allowed as the trial.
    pub fn allow(&self) -> Result<()> {
        let transition = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let now = Instant::now();
                    match st.next_retry_at {
                        Some(deadline) if now < deadline => {
                            return Err(Error::CircuitOpen {
                                service_id: self.service_id.clone(),
                                retry_in_ms: deadline.duration_since(now).as_millis() as u64,
                            });
                        }
                        _ => {
                            st.state = CircuitState::HalfOpen;
                            st.consecutive_successes = 0;
                            st.next_retry_at = None;
                            Some((CircuitState::Open, CircuitState::HalfOpen))
                        }
                    }
                }
            }
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
        Ok(())
    }

    /// Record a successful call and its duration.
    pub fn record_success(&self, duration: Duration) {
        self.record(true, duration);
    }

    /// Record a failed call and its duration.
    pub fn record_failure(&self, duration: Duration) {
        self.record(false, duration);
    }

    fn record(&self, success: bool, duration: Duration) {
        let transition = {
            let mut st = self.lock();
            let now = Instant::now();
            st.prune(self.cfg.monitoring_window, now);
            st.outcomes.push_back(Outcome {
                at: now,
                success,
                duration,
            });

            if success {
                st.total_successes += 1;
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);
                st.consecutive_failures = 0;
            } else {
                st.total_failures += 1;
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.consecutive_successes = 0;
            }

            match st.state {
                CircuitState::Closed => {
                    // The threshold check runs after every outcome: a window
                    // can cross the rate on a success once enough samples
                    // accumulate.
                    if st.outcomes.len() >= self.cfg.min_samples as usize
                        && st.failure_rate() * 100.0 >= f64::from(self.cfg.failure_threshold)
                    {
                        st.state = CircuitState::Open;
                        st.next_retry_at = Some(now + self.cfg.recovery_timeout);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if !success {
                        st.state = CircuitState::Open;
                        st.next_retry_at = Some(now + self.cfg.recovery_timeout);
                        Some((CircuitState::HalfOpen, CircuitState::Open))
                    } else if st.consecutive_successes >= self.cfg.success_threshold {
                        st.state = CircuitState::Closed;
                        st.outcomes.clear();
                        st.next_retry_at = None;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] without invoking `operation`
    /// while open; otherwise invokes it, records the outcome and duration,
    /// and returns the result or error unchanged. The state lock is held
    /// only for bookkeeping, never across the await.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();
        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current state, failure rate and response time distribution.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = Instant::now();
        let mut st = self.lock();
        st.prune(self.cfg.monitoring_window, now);

        let mut min_ms = u64::MAX;
        let mut max_ms = 0u64;
        let mut total_ms = 0.0;
        for outcome in &st.outcomes {
            let ms = outcome.duration.as_millis() as u64;
            min_ms = min_ms.min(ms);
            max_ms = max_ms.max(ms);
            total_ms += outcome.duration.as_secs_f64() * 1000.0;
        }
        let samples = st.outcomes.len();

        CircuitBreakerMetrics {
            state: st.state,
            failure_rate: st.failure_rate(),
            window_samples: samples,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            min_response_ms: if samples == 0 { 0 } else { min_ms },
            avg_response_ms: if samples == 0 {
                0.0
            } else {
                total_ms / samples as f64
            },
            max_response_ms: max_ms,
            open_remaining_ms: st.next_retry_at.and_then(|deadline| {
                if deadline > now {
                    Some(deadline.duration_since(now).as_millis() as u64)
                } else {
                    None
                }
            }),
        }
    }

    /// Force CLOSED with zeroed counters. Operator action only.
    pub fn reset(&self) {
        let transition = {
            let mut st = self.lock();
            let from = st.state;
            st.state = CircuitState::Closed;
            st.outcomes.clear();
            st.consecutive_failures = 0;
            st.consecutive_successes = 0;
            st.total_failures = 0;
            st.total_successes = 0;
            st.next_retry_at = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    /// Operator override: fail fast until the recovery deadline.
    pub fn force_open(&self) {
        let transition = {
            let mut st = self.lock();
            let from = st.state;
            st.state = CircuitState::Open;
            st.next_retry_at = Some(Instant::now() + self.cfg.recovery_timeout);
            (from != CircuitState::Open).then_some((from, CircuitState::Open))
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    /// Operator override: resume traffic, keeping historical totals.
    pub fn force_close(&self) {
        let transition = {
            let mut st = self.lock();
            let from = st.state;
            st.state = CircuitState::Closed;
            st.outcomes.clear();
            st.next_retry_at = None;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(50)
            .with_recovery_timeout(Duration::from_millis(50))
            .with_monitoring_window(Duration::from_secs(10))
            .with_min_samples(5)
            .with_success_threshold(3)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow().is_ok());
    }

    #[test]
    fn test_opens_when_windowed_rate_reaches_threshold() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        // 2 failures out of 4: below min_samples, stays closed.
        cb.record_failure(ms(10));
        cb.record_failure(ms(10));
        cb.record_success(ms(10));
        cb.record_success(ms(10));
        assert_eq!(cb.state(), CircuitState::Closed);

        // 5th sample makes it 3/5 = 60% >= 50%: opens.
        cb.record_failure(ms(10));
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.allow().unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
    }

    #[test]
    fn test_open_on_success_outcome_once_samples_suffice() {
        // 3 failures then 2 successes: the rate (60%) trips on the final
        // success once min_samples is reached.
        let cb = CircuitBreaker::new("svc-1", fast_config());
        cb.record_failure(ms(10));
        cb.record_failure(ms(10));
        cb.record_failure(ms(10));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_success(ms(10));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_success(ms(10));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_execute_fails_fast_without_invoking() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        for _ in 0..5 {
            cb.record_failure(ms(10));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = tokio_test::block_on(cb.execute(|| async {
            invoked.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, Error>(())
        }));
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_half_open_after_recovery_then_closes() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        for _ in 0..5 {
            cb.record_failure(ms(10));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(ms(60));
        // First allowed call transitions lazily to HALF_OPEN.
        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(ms(10));
        cb.record_success(ms(10));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(ms(10));
        assert_eq!(cb.state(), CircuitState::Closed);
        // The window restarts clean after closing.
        assert_eq!(cb.metrics().window_samples, 0);
    }

    #[test]
    fn test_half_open_single_failure_reopens() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        for _ in 0..5 {
            cb.record_failure(ms(10));
        }
        std::thread::sleep(ms(60));
        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(ms(10));
        cb.record_failure(ms(10));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow().is_err());
    }

    #[test]
    fn test_window_expiry_forgets_old_failures() {
        let cfg = fast_config().with_monitoring_window(ms(30));
        let cb = CircuitBreaker::new("svc-1", cfg);
        for _ in 0..4 {
            cb.record_failure(ms(1));
        }
        std::thread::sleep(ms(40));
        // Old failures fell out of the window; one more failure is 1/1 but
        // below min_samples.
        cb.record_failure(ms(1));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().window_samples, 1);
    }

    #[test]
    fn test_metrics_distribution() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        cb.record_success(ms(10));
        cb.record_success(ms(20));
        cb.record_failure(ms(60));

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert!((metrics.failure_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.min_response_ms, 10);
        assert_eq!(metrics.max_response_ms, 60);
        assert!((metrics.avg_response_ms - 30.0).abs() < 1e-9);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.consecutive_failures, 1);
    }

    #[test]
    fn test_reset_and_forced_transitions() {
        let cb = CircuitBreaker::new("svc-1", fast_config());
        for _ in 0..5 {
            cb.record_failure(ms(10));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let metrics = cb.metrics();
        assert_eq!(metrics.total_failures, 0);
        assert_eq!(metrics.window_samples, 0);

        cb.force_open();
        assert!(cb.allow().is_err());
        cb.force_close();
        assert!(cb.allow().is_ok());
        // force_close keeps historical totals.
        assert_eq!(cb.metrics().total_failures, 0);
    }

    #[test]
    fn test_listener_sees_transitions() {
        use std::sync::Mutex as StdMutex;

        struct Recording(StdMutex<Vec<(CircuitState, CircuitState)>>);
        impl StateListener for Recording {
            fn on_transition(&self, _id: &str, from: CircuitState, to: CircuitState) {
                self.0.lock().unwrap().push((from, to));
            }
        }

        let cb = CircuitBreaker::new("svc-1", fast_config());
        let listener = Arc::new(Recording(StdMutex::new(Vec::new())));
        cb.add_listener(listener.clone());

        for _ in 0..5 {
            cb.record_failure(ms(10));
        }
        std::thread::sleep(ms(60));
        cb.allow().unwrap();
        for _ in 0..3 {
            cb.record_success(ms(10));
        }

        let transitions = listener.0.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_thread_safe_recording() {
        use std::thread;

        let cfg = fast_config().with_failure_threshold(100).with_min_samples(1000);
        let cb = Arc::new(CircuitBreaker::new("svc-1", cfg));

        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    cb_clone.record_success(ms(1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.metrics().total_successes, 500);
    }
}
