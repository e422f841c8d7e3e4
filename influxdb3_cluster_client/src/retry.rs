use std::{
    future::Future,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use backoff::{Backoff, BackoffConfig, BackoffError};
use metric::{Metric, Registry, U64Counter};

use crate::{Error, Result};

const RETRIER_ATTEMPTS_METRIC_NAME: &str = "cluster_client_retrier_attempts";
const RETRIER_ERRORS_METRIC_NAME: &str = "cluster_client_retrier_errors";

/// Exponential backoff settings for retrying a whole session operation.
///
/// Each sleep is picked at random between `initial_backoff` and `backoff_factor` times the
/// previous sleep, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryOptions {
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Stop retrying once this much time has passed since the first attempt.
    pub deadline: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
            max_retries: 2,
            deadline: None,
        }
    }
}

impl RetryOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.backoff_factor < 1.0 {
            return Err(Error::InvalidOptions(format!(
                "retry backoff factor {} is less than 1",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            init_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            base: self.backoff_factor,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Retrier {
    op: &'static str,
    max_retries: usize,
    backoff_config: BackoffConfig,
    attempts: U64Counter,
    errors_retryable: U64Counter,
    errors_not_retryable: U64Counter,
    errors_final: U64Counter,
}

impl Retrier {
    pub(crate) fn new(opts: RetryOptions, op: &'static str, registry: &Arc<Registry>) -> Self {
        let attempts: Metric<U64Counter> = registry.register_metric(
            RETRIER_ATTEMPTS_METRIC_NAME,
            "attempts made by the session retriers",
        );
        let errors: Metric<U64Counter> = registry.register_metric(
            RETRIER_ERRORS_METRIC_NAME,
            "failed attempts of the session retriers",
        );
        Self {
            op,
            max_retries: opts.max_retries,
            backoff_config: opts.backoff_config(),
            attempts: attempts.recorder([("op", op)]),
            errors_retryable: errors.recorder([("op", op), ("outcome", "retryable")]),
            errors_not_retryable: errors.recorder([("op", op), ("outcome", "not_retryable")]),
            errors_final: errors.recorder([("op", op), ("outcome", "final")]),
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, runs out of retries or
    /// passes the deadline.
    pub(crate) async fn attempt<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let retries = AtomicUsize::new(0);
        let res = Backoff::new(&self.backoff_config)
            .retry_with_backoff(self.op, || {
                let attempt = f();
                let retries = &retries;
                async move {
                    self.attempts.inc(1);
                    let err = match attempt.await {
                        Ok(v) => return ControlFlow::Break(Ok(v)),
                        Err(e) => e,
                    };
                    if err.is_non_retryable() {
                        self.errors_not_retryable.inc(1);
                        return ControlFlow::Break(Err(err));
                    }
                    if retries.fetch_add(1, Ordering::Relaxed) >= self.max_retries {
                        self.errors_final.inc(1);
                        return ControlFlow::Break(Err(err));
                    }
                    self.errors_retryable.inc(1);
                    ControlFlow::Continue(err)
                }
            })
            .await;

        match res {
            Ok(res) => res,
            Err(BackoffError::DeadlineExceeded { source, .. }) => {
                self.errors_final.inc(1);
                Err(source)
            }
        }
    }
}
