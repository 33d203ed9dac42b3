// src/pipeline/retry.rs

//! Exponential-backoff retry policy.
//!
//! The policy never logs. Every attempt outcome is handed to the caller's
//! event callback, and collectors decide how to report it.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, FailureClass, Result};
use crate::models::RetryConfig;

/// Something the retry loop did, reported to the caller.
#[derive(Debug)]
pub enum RetryEvent<'a> {
    /// A transient failure; the next attempt starts after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: &'a AppError,
    },
    /// The upstream asked us to slow down; pausing for `cooldown`.
    CoolingDown {
        cooldown: Duration,
        error: &'a AppError,
    },
    /// A retry eventually succeeded.
    Recovered { attempts: u32 },
    /// The error is returned to the caller.
    GaveUp {
        attempts: u32,
        retryable: bool,
        error: &'a AppError,
    },
}

/// Retry settings for one upstream.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_cooldown: Duration,
    /// Rate-limit cooldowns allowed per call before the signal counts as a failed attempt
    pub max_cooldowns: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            max_cooldowns: config.max_attempts.max(1),
        }
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            max_cooldowns: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Retry `op` using the default error classification.
    pub async fn retry<T, F, Fut>(&self, op: F, on_event: impl FnMut(RetryEvent<'_>)) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_with(op, AppError::failure_class, on_event).await
    }

    /// Retry `op`, classifying failures with `classify`.
    pub async fn retry_with<T, F, Fut>(
        &self,
        mut op: F,
        classify: impl Fn(&AppError) -> FailureClass,
        mut on_event: impl FnMut(RetryEvent<'_>),
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut failures: u32 = 0;
        let mut cooldowns: u32 = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        on_event(RetryEvent::Recovered { attempts: attempt });
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            match classify(&error) {
                FailureClass::Fatal => {
                    on_event(RetryEvent::GaveUp {
                        attempts: attempt,
                        retryable: false,
                        error: &error,
                    });
                    return Err(error);
                }
                FailureClass::RateLimited if cooldowns < self.max_cooldowns => {
                    cooldowns += 1;
                    on_event(RetryEvent::CoolingDown {
                        cooldown: self.rate_limit_cooldown,
                        error: &error,
                    });
                    tokio::time::sleep(self.rate_limit_cooldown).await;
                }
                FailureClass::RateLimited | FailureClass::Transient => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        on_event(RetryEvent::GaveUp {
                            attempts: attempt,
                            retryable: true,
                            error: &error,
                        });
                        return Err(error);
                    }
                    let delay = self.backoff_delay(failures);
                    on_event(RetryEvent::Retrying {
                        attempt,
                        delay,
                        error: &error,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(p.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(p.backoff_delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut delays = Vec::new();
        let mut recovered = None;

        let result = policy()
            .retry(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(AppError::upstream("search", 503))
                        } else {
                            Ok(7)
                        }
                    }
                },
                |event| match event {
                    RetryEvent::Retrying { delay, .. } => delays.push(delay),
                    RetryEvent::Recovered { attempts } => recovered = Some(attempts),
                    _ => {}
                },
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(recovered, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut gave_up = None;

        let result: Result<()> = policy()
            .retry(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(AppError::upstream("search", 500))
                    }
                },
                |event| {
                    if let RetryEvent::GaveUp {
                        attempts,
                        retryable,
                        ..
                    } = event
                    {
                        gave_up = Some((attempts, retryable));
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(gave_up, Some((3, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<()> = policy()
            .retry(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(AppError::auth("reddit", "invalid_grant"))
                    }
                },
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(AppError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_triggers_cooldown_then_resumes() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut cooldowns = Vec::new();
        let start = Instant::now();

        let result = policy()
            .retry(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) {
                            0 => Err(AppError::RateLimited("reddit".into())),
                            1 => Err(AppError::upstream("search", 502)),
                            _ => Ok("done"),
                        }
                    }
                },
                |event| {
                    if let RetryEvent::CoolingDown { cooldown, .. } = event {
                        cooldowns.push(cooldown);
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(cooldowns, vec![Duration::from_secs(30)]);
        // cooldown, then the first backoff step
        assert_eq!(start.elapsed(), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_overrides_default() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = policy()
            .retry_with(
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(AppError::upstream("search", 503))
                    }
                },
                |_| FailureClass::Fatal,
                |_| {},
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
