use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Exponential backoff with full jitter, bounded by attempt count and a
/// total time budget. Only transient faults are retried; the caller
/// supplies the classifier.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub jitter: Duration,
    pub max_retries: u32,
    pub total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            jitter: Duration::from_millis(100),
            max_retries: 3,
            total_budget: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt plus
    /// a uniform random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::rng().random_range(0..self.jitter.as_millis() as u64)
        };
        exp + Duration::from_millis(jitter_ms)
    }

    pub async fn run<T, E, F, Fut, C>(&self, is_transient: C, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries || !is_transient(&e) {
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    if started.elapsed() + delay > self.total_budget {
                        return Err(e);
                    }
                    debug!(attempt, ?delay, "transient fault, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let p = policy();
        for attempt in 0..3 {
            let expected = Duration::from_millis(100 * (1 << attempt));
            let delay = p.backoff(attempt);
            assert!(delay >= expected);
            assert!(delay < expected + Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy()
            .run(
                |_| true,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("transient") } else { Ok(n) } }
                },
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = policy()
            .run(
                |_| false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
            )
            .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = policy()
            .run(
                |_| true,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("transient") }
                },
            )
            .await;
        assert_eq!(result, Err("transient"));
        // Initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
