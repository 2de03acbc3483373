//! Shared exponential-backoff helper.
//!
//! Two call sites need "wait, then try again" with growing delays: the
//! request queue's retry delay on a transient transport error
//! (default 10s, fixed — no growth) and output-directory creation
//! under contention. Both are expressed as
//! a `BackoffSchedule` so the growth rule lives in one place.

use std::time::Duration;

use rand::Rng;

/// A bounded sequence of delays: `base`, `base * factor`, `base *
/// factor^2`, ... up to `max_attempts`, each with up to `jitter` added.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    pub base: Duration,
    pub factor: f64,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl BackoffSchedule {
    /// The queue's retry delay: fixed 10 seconds, unbounded attempts,
    /// no jitter.
    pub fn queue_retry() -> Self {
        Self {
            base: Duration::from_secs(10),
            factor: 1.0,
            jitter: Duration::ZERO,
            max_attempts: u32::MAX,
        }
    }

    /// The output-directory creation retry: 5 attempts, 1s fixed plus
    /// up to 4s random, factor 1.6.
    pub fn output_dir_creation() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.6,
            jitter: Duration::from_secs(4),
            max_attempts: 5,
        }
    }

    /// Delay before the given attempt number (1-indexed: the delay
    /// waited *after* attempt `n` fails, before attempt `n + 1`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jitter = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=self.jitter.as_secs_f64())
        };
        Duration::from_secs_f64(grown + jitter)
    }

    /// Runs `attempt` against the schedule, retrying on `Err` with the
    /// scheduled delay, until it succeeds or attempts are exhausted (in
    /// which case the last error is returned).
    pub async fn retry<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if n >= self.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for_attempt(n)).await;
                    n += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_retry_is_fixed_ten_seconds() {
        let sched = BackoffSchedule::queue_retry();
        assert_eq!(sched.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(sched.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn output_dir_schedule_grows_with_bounded_jitter() {
        let sched = BackoffSchedule::output_dir_creation();
        assert_eq!(sched.max_attempts, 5);
        let d1 = sched.delay_for_attempt(1);
        assert!(d1 >= Duration::from_secs(1) && d1 <= Duration::from_secs(5));
        let d3 = sched.delay_for_attempt(3);
        // base * factor^2 = 1 * 1.6^2 = 2.56s, plus up to 4s jitter.
        assert!(d3 >= Duration::from_secs_f64(2.56));
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let sched = BackoffSchedule {
            base: Duration::from_millis(1),
            factor: 1.0,
            jitter: Duration::ZERO,
            max_attempts: 3,
        };
        let mut calls = 0u32;
        let result: Result<(), &str> = sched
            .retry(|_attempt| {
                calls += 1;
                async { Err("still failing") }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_returns_on_success() {
        let sched = BackoffSchedule {
            base: Duration::from_millis(1),
            factor: 1.0,
            jitter: Duration::ZERO,
            max_attempts: 5,
        };
        let mut calls = 0u32;
        let result = sched
            .retry(|attempt| {
                calls += 1;
                async move {
                    if attempt < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 2);
    }
}
