use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How many times to retry and how long to wait in between.
///
/// The delay before retry `i` (zero-based) is `initial_delay * factor^i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Scale every delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Run the operation once, never retry.
    pub fn none() -> Self {
        Self {
            retries: 0,
            initial_delay: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    pub fn with_backoff(retries: u32, initial_delay: Duration, factor: f64) -> Self {
        Self {
            retries,
            initial_delay,
            factor,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The un-jittered sleep schedule, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor.max(0.0);
        let mut next = self.initial_delay;
        (0..self.retries).map(move |_| {
            let current = next;
            next = scale(next, factor);
            current
        })
    }
}

impl Default for RetryPolicy {
    /// Three retries after 1s, 2s and 4s.
    fn default() -> Self {
        Self::with_backoff(3, Duration::from_secs(1), 2.0)
    }
}

/// Executes a fallible operation until it succeeds or the retry budget runs
/// out, sleeping with geometric backoff between attempts.
///
/// The operation is repeated as a whole. Callers must make it safe to run
/// more than once.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Blocking variant for synchronous callers (the SQLite backend).
    /// Returns the last error unchanged once the budget is spent.
    pub fn retry<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut delays = self.policy.delays();
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        let delay = self.jittered(delay);
                        tracing::debug!(attempt, ?delay, error = %e, "operation failed, retrying");
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Async variant; sleeps on the tokio timer instead of the thread.
    pub async fn retry_async<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delays = self.policy.delays();
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        let delay = self.jittered(delay);
                        tracing::debug!(attempt, ?delay, error = %e, "operation failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.policy.jitter || delay.is_zero() {
            return delay;
        }
        scale(delay, rand::thread_rng().gen_range(0.5..=1.5))
    }
}

/// `d * factor`, saturating at [`Duration::MAX`] instead of panicking.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast() -> Retrier {
        Retrier::new(RetryPolicy::with_backoff(3, Duration::from_millis(10), 2.0))
    }

    #[test]
    fn delay_schedule_is_geometric() {
        let delays: Vec<_> = fast().policy().delays().collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn runaway_backoff_saturates() {
        let policy = RetryPolicy::with_backoff(4, Duration::from_secs(1), 1e30);
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[3], Duration::MAX);

        let retrier = Retrier::new(policy.with_jitter(true));
        for _ in 0..20 {
            assert!(retrier.jittered(Duration::MAX) >= Duration::MAX / 2);
        }
    }

    #[test]
    fn success_on_first_call_does_not_sleep() {
        let calls = Cell::new(0);
        let started = Instant::now();
        let out: Result<u8, String> = fast().retry(|| {
            calls.set(calls.get() + 1);
            Ok(7)
        });
        assert_eq!(out, Ok(7));
        assert_eq!(calls.get(), 1);
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn fails_twice_then_succeeds() {
        let calls = Cell::new(0);
        let started = Instant::now();
        let out: Result<&str, String> = fast().retry(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(format!("boom {}", calls.get()))
            } else {
                Ok("ok")
            }
        });
        assert_eq!(out, Ok("ok"));
        assert_eq!(calls.get(), 3);
        // 10ms + 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn returns_last_error_after_budget() {
        let calls = Cell::new(0);
        let out: Result<(), String> = fast().retry(|| {
            calls.set(calls.get() + 1);
            Err(format!("attempt {}", calls.get()))
        });
        assert_eq!(out, Err("attempt 4".to_string()));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn zero_retries_calls_once() {
        let calls = Cell::new(0);
        let out: Result<(), &str> = Retrier::new(RetryPolicy::none()).retry(|| {
            calls.set(calls.get() + 1);
            Err("nope")
        });
        assert_eq!(out, Err("nope"));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn async_sleeps_ten_then_twenty_millis() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let out: Result<u32, String> = fast()
            .retry_async(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out, Ok(3));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(40), "{elapsed:?}");
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let retrier = Retrier::new(
            RetryPolicy::with_backoff(1, Duration::from_millis(100), 2.0).with_jitter(true),
        );
        for _ in 0..100 {
            let d = retrier.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }
}
