use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub rps: f64,
    pub burst: f64,
    pub tokens: f64,
    /// Estimated wait time until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens per second.
    pub rps: f64,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self {
            rps,
            burst: rps.max(1.0), // default burst: 1 second worth, at least 1
        })
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst.max(1.0);
        self
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
}

/// Per-service token-bucket rate limiter.
///
/// - Only constructed when the service configures a rate limit
/// - Bookkeeping under the lock; sleeping happens outside it
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let burst = cfg.burst;
        let state = Mutex::new(State {
            tokens: burst,
            last: Instant::now(),
        });
        Self { cfg, state }
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rps).min(cfg.burst);
            st.last = now;
        }
    }

    /// Acquire one token (may sleep).
    pub async fn acquire(&self) {
        loop {
            let wait_duration = {
                let mut st = self.state.lock().await;
                Self::refill_locked(&self.cfg, &mut st);
                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return;
                }
                let missing = 1.0 - st.tokens;
                Duration::from_secs_f64(missing / self.cfg.rps)
            };
            tokio::time::sleep(wait_duration).await;
        }
    }

    /// Acquire without waiting. Returns whether a token was taken.
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        Self::refill_locked(&self.cfg, &mut st);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        Self::refill_locked(&self.cfg, &mut st);
        let estimated_wait_ms = if st.tokens >= 1.0 {
            None
        } else {
            let missing = 1.0 - st.tokens;
            Some((missing / self.cfg.rps * 1000.0).ceil() as u64)
        };
        RateLimiterSnapshot {
            rps: self.cfg.rps,
            burst: self.cfg.burst,
            tokens: st.tokens,
            estimated_wait_ms,
        }
    }
}
