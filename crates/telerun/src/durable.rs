//! # Durable Calls
//!
//! `durable` reruns a body until it succeeds, retrying the failures the
//! runtime knows to be transient.
//!
//! | failure | action |
//! |---|---|
//! | not a `telerun::Error` | returned on the first attempt |
//! | `UnresolvedService` | retried on a fixed delay, then with doubling backoff |
//! | disconnections, closed routes, not-ready services, consumed resources | retried at once |
//! | everything else (timeouts, conflicts, remote failures, poison) | returned |
//!
//! Immediate retries need no delay: the call primitives already wait for
//! reconnection and for routes to reopen.
//!
//! The body may run more than once. It must be idempotent.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::DurablePolicy;
use crate::error::Error;
use crate::error::RetryClass;

/// Delays between retries of an unresolved service.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: DurablePolicy,
    attempt: u32,
    delay: Duration,
}

impl RetrySchedule {
    pub fn new(policy: DurablePolicy) -> Self {
        let delay = policy.fixed_delay;
        Self { policy, attempt: 0, delay }
    }

    /// The delay before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt <= self.policy.retries_before_backoff {
            return self.policy.fixed_delay;
        }
        if self.attempt == self.policy.retries_before_backoff + 1 {
            warn!(
                retries = self.policy.retries_before_backoff,
                "service still unresolved, switching to exponential backoff"
            );
        }
        self.delay = self.delay.saturating_mul(2).min(self.policy.max_delay);
        self.delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Runs `body` until it succeeds, the failure is fatal, or `cancel` fires.
///
/// Each attempt gets a fresh child token of `cancel`, cancelled when the
/// attempt ends. On cancellation the last failure is returned.
pub async fn durable<T, F, Fut>(cancel: &CancellationToken, policy: &DurablePolicy, mut body: F) -> anyhow::Result<T>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut schedule = RetrySchedule::new(policy.clone());

    if cancel.is_cancelled() {
        anyhow::bail!("durable scope was cancelled before the first attempt");
    }

    loop {
        let scope = cancel.child_token();
        let outcome = body(scope.clone()).await;
        scope.cancel();

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let Some(class) = error.downcast_ref::<Error>().map(Error::retry_class) else {
            return Err(error);
        };

        match class {
            RetryClass::Fatal => return Err(error),
            RetryClass::Immediate => {
                debug!(error = %error, "retrying at once");
                tokio::task::yield_now().await;
            }
            RetryClass::Backoff => {
                let delay = schedule.next_delay();
                debug!(error = %error, delay = ?delay, attempt = schedule.attempts(), "retrying after delay");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(error);
        }
    }
}
