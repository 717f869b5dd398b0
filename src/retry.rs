// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policies
//!
//! A small policy type shared by connect and publish. Only transient
//! transport failures are retried; anything else is returned at once.

use crate::errors::TransportError;
use std::{future::Future, time::Duration};
use tracing::warn;

/// Wait strategy between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^attempt`
    Exponential { base: Duration },
    /// Same wait every time
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// At most `attempts` tries with exponential backoff (1s base).
    pub fn exponential(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(attempts.max(1)),
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
            },
        }
    }

    /// Unbounded tries at a fixed interval.
    pub fn forever(interval: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: None,
            backoff: Backoff::Fixed(interval),
        }
    }

    /// Replaces the exponential base; no effect on fixed policies.
    pub fn with_base(mut self, base: Duration) -> Self {
        if let Backoff::Exponential { .. } = self.backoff {
            self.backoff = Backoff::Exponential { base };
        }
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Wait before the attempt following the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential { base } => base.saturating_mul(2u32.saturating_pow(attempt)),
            Backoff::Fixed(interval) => interval,
        }
    }

    /// Runs `op` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.run_until(what, op, || false).await
    }

    /// Like [`RetryPolicy::run`], but stops before the next try once `cancelled` returns true.
    pub async fn run_until<T, F, Fut, C>(
        &self,
        what: &str,
        mut op: F,
        cancelled: C,
    ) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        C: Fn() -> bool,
    {
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            warn!(
                error = err.to_string(),
                attempt,
                "could not {} after {:.1} seconds, waiting to try again",
                what,
                delay.as_secs_f64()
            );

            tokio::time::sleep(delay).await;

            if cancelled() {
                return Err(err);
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let policy = RetryPolicy::exponential(5);

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_the_limit_eventually_succeed() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5);

        let result = policy
            .run("publish", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 4 {
                        Err(TransportError::Socket("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3);

        let result: Result<(), _> = policy
            .run("connect", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(TransportError::Unreachable(format!("try {attempt}"))) }
            })
            .await;

        assert_eq!(result, Err(TransportError::Unreachable("try 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::exponential(5)
            .run("publish", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Protocol("NOT_FOUND".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forever_stops_only_when_cancelled() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::forever(Duration::from_secs(15))
            .run_until(
                "connect",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TransportError::Unreachable("down".into())) }
                },
                || calls.load(Ordering::SeqCst) >= 20,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }
}
