//! # Retry Executor
//!
//! Runs an async operation and retries it while it fails with
//! [`ProviderError::RateLimited`]. Sleeps follow [`RetryPolicy::sleep_ms`]:
//! a server hint (header or "try again in" message) plus padding when
//! present, else capped exponential backoff, plus up to 10% jitter.
//!
//! Every other error propagates on the first failure. The executor holds no
//! shared state; one instance can serve any number of concurrent calls.

use std::future::Future;
use std::time::Duration;

use strata_core::RetryPolicy;
use strata_core::retry::parse_retry_hint_ms;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ProviderError, Result};

/// Callback invoked before each sleep with `(sleep_seconds, attempt)`.
pub type RetryObserver<'a> = dyn Fn(f64, u32) + Send + Sync + 'a;

/// Rate-limit retry loop bound to a policy.
#[derive(Clone, Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor {
    /// Executor using `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Abort pending sleeps when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying rate-limit failures up to `max_attempts` in total.
    pub async fn run<T, F, Fut>(
        &self,
        op_name: &str,
        observer: Option<&RetryObserver<'_>>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_rate_limited() || attempt >= max_attempts {
                if err.is_rate_limited() {
                    warn!(op = op_name, attempt, "rate limit retries exhausted");
                }
                return Err(err);
            }

            let hint = err.retry_after_ms().or_else(|| match &err {
                ProviderError::RateLimited { message, .. } => parse_retry_hint_ms(message),
                _ => None,
            });
            let sleep_ms = self
                .policy
                .sleep_ms(attempt, hint, rand::random::<f64>());

            metrics::counter!("retry_attempts_total", "op" => op_name.to_string()).increment(1);
            warn!(
                op = op_name,
                attempt,
                max_attempts,
                sleep_ms,
                hint_ms = hint,
                "rate limited, retrying"
            );
            if let Some(observe) = observer {
                #[allow(clippy::cast_precision_loss)]
                let secs = sleep_ms as f64 / 1000.0;
                observe(secs, attempt);
            }

            let sleep = tokio::time::sleep(Duration::from_millis(sleep_ms));
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(ProviderError::Cancelled),
                        () = sleep => {}
                    }
                }
                None => sleep.await,
            }
            attempt += 1;
        }
    }
}

/// One-shot form of [`RetryExecutor::run`].
pub async fn retry_rate_limited<T, F, Fut>(
    op_name: &str,
    policy: &RetryPolicy,
    observer: Option<&RetryObserver<'_>>,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(policy.clone())
        .run(op_name, observer, op)
        .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
