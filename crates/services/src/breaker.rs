use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker around an unreliable collaborator (shared store,
/// database). While OPEN, calls fail fast with a distinguishable error so
/// callers can degrade instead of piling up timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Successes required in HALF_OPEN to close again.
    pub success_threshold: u32,
    /// How long the breaker stays OPEN before probing.
    pub reset_timeout: Duration,
    /// Per-call timeout; an elapsed call counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Runs `fut` under the breaker with the configured call timeout.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }

        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Returns false while OPEN and the reset window has not elapsed.
    /// Transitions OPEN -> HALF_OPEN once it has.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    debug!(breaker = self.name, "half-open probe window");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub(crate) fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    debug!(breaker = self.name, "closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub(crate) fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(breaker = self.name, "open");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            // One failure while probing re-opens.
            BreakerState::HalfOpen => {
                warn!(breaker = self.name, "re-opened from half-open");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_millis(100),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call::<(), _, _>(async { Err("boom".to_string()) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call::<_, String, _>(async { Ok(()) }).await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let res = breaker.call::<(), String, _>(async { Ok(()) }).await;
        assert!(matches!(res, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let res = breaker.call::<(), String, _>(async { Ok(()) }).await;
        assert!(matches!(res, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            let res = breaker
                .call::<(), String, _>(async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .await;
            assert!(matches!(res, Err(BreakerError::Timeout(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", fast_config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
