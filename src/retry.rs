use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::publisher::PublishError;

/// Bounded exponential backoff for transient destination failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, where `attempt` (1-based) just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1_u32 << exp);
        if self.max_delay.is_zero() {
            delay
        } else {
            delay.min(self.max_delay)
        }
    }

    /// Run `op` until it succeeds, fails permanently or the attempt budget is spent.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, PublishError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(what, attempt, ?delay, %err, "transient failure; backing off");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::new(5, Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(p.delay_after(1), Duration::from_secs(5));
        assert_eq!(p.delay_after(2), Duration::from_secs(10));
        assert_eq!(p.delay_after(3), Duration::from_secs(20));
        assert_eq!(p.delay_after(4), Duration::from_secs(30));
        assert_eq!(p.delay_after(40), Duration::from_secs(30));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn stops_at_max_attempts_on_transient() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = RetryPolicy::immediate(3)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PublishError::Transient("503".into())) }
            })
            .await;
        assert!(matches!(res, Err(PublishError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = RetryPolicy::immediate(3)
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PublishError::Rejected {
                        status: 400,
                        message: "bad".into(),
                    })
                }
            })
            .await;
        assert!(matches!(res, Err(PublishError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let res = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(60))
            .run("op", |attempt| async move {
                if attempt < 3 {
                    Err(PublishError::Transient("timeout".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }
}
