use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{StrategyConfig, UploadError};

/// Linear backoff shared by every strategy: retry `n` waits `base * n`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Why a retried operation gave up
#[derive(Debug, Clone)]
pub enum RetryError {
    /// Cancellation fired before or between attempts
    Cancelled { attempts: u32 },
    /// Every allowed attempt failed with a retryable error
    Exhausted { error: UploadError, attempts: u32 },
    /// An attempt failed with an error that must not be repeated
    Fatal { error: UploadError, attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StrategyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails fatally, runs out of attempts or is cancelled
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                outcome = op(attempt) => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(RetryError::Fatal { error, attempts: attempt });
            }
            if attempt >= self.max_attempts() {
                return Err(RetryError::Exhausted { error, attempts: attempt });
            }

            let delay = self.delay_for(attempt);
            warn!(
                label,
                attempt,
                max_attempts = self.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn delay_grows_linearly_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(250));
        assert_eq!(p.max_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let value = policy()
            .run("flaky", &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(UploadError::backend("503"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget() {
        let cancel = CancellationToken::new();
        let err = policy()
            .run("down", &cancel, |_| async { Err::<(), _>(UploadError::backend("down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let err = policy()
            .run("invalid", &cancel, |_| async {
                Err::<(), _>(UploadError::validation("bad"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = policy()
            .run("cancelled", &cancel, |_| async { Ok::<_, UploadError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 0 }));
    }
}
