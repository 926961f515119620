//! Retry with bounded, classified backoff.
//!
//! Wraps a unary continuation with a fresh attempt counter and elapsed-time
//! stopwatch per invocation. Classification is an explicit function over the
//! error, not an error-type hierarchy; cancellation aborts backoff delays
//! immediately and is never retried.

use crate::cancellation::{sleep_cancellable, CancellationToken};
use crate::dispatch::{Behavior, Next};
use crate::errors::FlowguardError;
use crate::events::EventSink;
use crate::request::Request;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Classifies whether an error is retryable.
pub type RetryClassifier = Arc<dyn Fn(&FlowguardError) -> bool + Send + Sync>;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = initial (constant)
    Fixed,
    /// delay = initial * 2^attempt
    #[default]
    Exponential,
    /// Exponential base +/- uniformly random 25%, clamped to >= 0.
    ExponentialJitter,
}

/// Immutable retry configuration, one per pipeline.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retry_attempts: usize,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Budget for total time spent across all attempts.
    pub max_total_retry_time: Duration,
    classifier: RetryClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_total_retry_time: Duration::from_secs(30),
            classifier: Arc::new(FlowguardError::is_transient),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default classification
    /// ([`FlowguardError::is_transient`]).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: usize) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the total retry-time budget.
    #[must_use]
    pub fn with_max_total_retry_time(mut self, budget: Duration) -> Self {
        self.max_total_retry_time = budget;
        self
    }

    /// Sets the retryability classifier.
    #[must_use]
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&FlowguardError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Returns true if the policy classifies `error` as retryable.
    #[must_use]
    pub fn is_retryable(&self, error: &FlowguardError) -> bool {
        (self.classifier)(error)
    }

    /// Calculates the delay before retrying after the given 0-indexed
    /// attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
            BackoffStrategy::ExponentialJitter => {
                let factor = 2u64.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                let exponential = base_ms.saturating_mul(factor) as f64;
                // Per-call generator; no shared RNG state across callers.
                let jitter: f64 = rand::thread_rng().gen_range(-0.25..=0.25);
                let jittered = (exponential * (1.0 + jitter)).max(0.0);
                Duration::from_millis(jittered as u64)
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("strategy", &self.strategy)
            .field("initial_delay", &self.initial_delay)
            .field("max_total_retry_time", &self.max_total_retry_time)
            .finish_non_exhaustive()
    }
}

/// Executes `operation` under the retry policy.
///
/// Total attempts never exceed `max_retry_attempts + 1`. The error returned
/// on exhaustion is the most recent real failure.
///
/// # Errors
///
/// Propagates the last failure when the classification rejects it, the time
/// budget is exhausted, attempts run out, or cancellation is observed.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ct: &CancellationToken,
    mut operation: F,
) -> Result<T, FlowguardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlowguardError>>,
{
    let started = Instant::now();
    let mut attempt: usize = 0;

    loop {
        if ct.is_cancelled() {
            return Err(FlowguardError::cancelled(ct.reason()));
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_cancelled() || !policy.is_retryable(&err) {
                    return Err(err);
                }
                if started.elapsed() >= policy.max_total_retry_time
                    || attempt >= policy.max_retry_attempts
                {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after error"
                );
                sleep_cancellable(delay, ct).await?;
                attempt += 1;
            }
        }
    }
}

/// Unary behavior applying [`RetryPolicy`] to its continuation.
pub struct RetryBehavior<R> {
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    _request: PhantomData<fn(R)>,
}

impl<R> RetryBehavior<R> {
    /// Creates a retry behavior with no event sink.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sink: Arc::new(crate::events::NoOpEventSink),
            _request: PhantomData,
        }
    }

    /// Attaches an event sink receiving `retry.attempt` events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for RetryBehavior<R> {
    async fn handle(
        &self,
        request: Arc<R>,
        next: Next<R>,
        ct: CancellationToken,
    ) -> Result<R::Response, FlowguardError> {
        let attempts = AtomicUsize::new(0);
        execute_with_retry(&self.policy, &ct, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n > 0 {
                self.sink.try_emit(
                    "retry.attempt",
                    Some(serde_json::json!({
                        "request": R::name(),
                        "attempt": n,
                    })),
                );
            }
            next.run(request.clone(), ct.clone())
        })
        .await
    }
}
