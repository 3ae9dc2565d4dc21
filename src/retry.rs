//! Reusable exponential-backoff retry policy.
//!
//! The policy runs an operation up to `max_attempts` times.  Between attempts
//! it sleeps `init_backoff * multiplier^(n-1)`, capped at `max_backoff`.  The
//! wait is raced against a [`ShutdownSignal`] so that a pending retry never
//! holds up process shutdown.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::KeepaliveConfig;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub multiplier: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last:#}")]
    Exhausted { attempts: u32, last: anyhow::Error },
    #[error("retry cancelled by shutdown")]
    Cancelled,
}

impl RetryPolicy {
    pub fn new(init_backoff: Duration, max_backoff: Duration, max_attempts: u32) -> Self {
        Self {
            init_backoff,
            max_backoff,
            max_attempts,
            multiplier: 2.0,
        }
    }

    pub fn from_keepalive(config: &KeepaliveConfig) -> Self {
        Self::new(
            config.retry_init_backoff(),
            config.retry_max_backoff(),
            config.retry_max_attempts,
        )
    }

    /// Delay to wait after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.init_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, the attempt budget is spent, or shutdown
    /// is requested.  `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        shutdown: &mut ShutdownSignal,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff(attempt - 1);
                debug!(attempt, ?delay, "waiting before next attempt");
                tokio::select! {
                    () = shutdown.recv() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            if shutdown.is_triggered() {
                return Err(RetryError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, max_attempts, error = %format!("{e:#}"), "attempt failed");
                    last = Some(e);
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: max_attempts,
            last: last.unwrap_or_else(|| anyhow::anyhow!("no attempt was made")),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::shutdown;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 6)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::ZERO);
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
        assert_eq!(p.backoff(60), Duration::from_secs(5));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let (_trigger, mut signal) = shutdown::channel();
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result: Result<(), _> = policy()
            .run(&mut signal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("manager unreachable")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 6, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // 1 + 2 + 4 + 5 + 5
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(17), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(17_050), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let (_trigger, mut signal) = shutdown::channel();
        let result = policy()
            .run(&mut signal, |attempt| async move {
                if attempt < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(attempt)
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_pending_backoff() {
        let (trigger, mut signal) = shutdown::channel();
        let slow = RetryPolicy::new(Duration::from_secs(3600), Duration::from_secs(3600), 10);

        let handle = tokio::spawn(async move {
            slow.run(&mut signal, |_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let (_trigger, mut signal) = shutdown::channel();
        let p = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1), 0);
        let calls = AtomicU32::new(0);
        let _ = p
            .run(&mut signal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("nope")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
