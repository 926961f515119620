//! Three-state circuit breaker shared across calls of one request type.
//!
//! Closed passes calls through and records outcomes into a rolling window;
//! Open fails fast without invoking the inner continuation; HalfOpen admits
//! a bounded trial batch. State lives for the process (or until `reset`),
//! one instance per request type, shared by all concurrent callers.

mod window;

use crate::cancellation::CancellationToken;
use crate::decouple::{decouple, StreamHooks};
use crate::dispatch::{Behavior, Next, StreamBehavior, StreamNext};
use crate::errors::FlowguardError;
use crate::events::{EventSink, NoOpEventSink};
use crate::request::{ItemStream, Request, StreamRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use window::SampleWindow;

/// Classifies whether an error counts as a breaker failure.
pub type FailureClassifier = Arc<dyn Fn(&FlowguardError) -> bool + Send + Sync>;

/// Public view of the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Calls pass through; outcomes are recorded.
    Closed,
    /// Calls fail fast until the break duration elapses.
    Open,
    /// A bounded trial batch probes downstream recovery.
    HalfOpen,
}

/// Circuit breaker configuration, immutable per breaker.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Failure percentage at or above which the circuit opens.
    pub failure_threshold_pct: f64,
    /// Minimum samples in the window before the threshold is evaluated.
    pub minimum_throughput: usize,
    /// Width of the rolling sample window.
    pub sampling_duration: Duration,
    /// How long the circuit stays open before admitting trials.
    pub break_duration: Duration,
    /// Maximum concurrent HalfOpen trial calls.
    pub trial_request_count: usize,
    /// Streams that yield at least this many items before failing record as
    /// breaker-success. 0 disables the leniency.
    pub partial_success_threshold: u64,
    failure_classifier: FailureClassifier,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_pct: 50.0,
            minimum_throughput: 10,
            sampling_duration: Duration::from_secs(60),
            break_duration: Duration::from_secs(30),
            trial_request_count: 1,
            partial_success_threshold: 0,
            // Cancellation is filtered out before classification.
            failure_classifier: Arc::new(|_| true),
        }
    }
}

impl BreakerConfig {
    /// Creates a config with defaults: 50% threshold, 10 minimum samples,
    /// 60s window, 30s break, one trial.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold percentage.
    #[must_use]
    pub fn with_failure_threshold_pct(mut self, pct: f64) -> Self {
        self.failure_threshold_pct = pct;
        self
    }

    /// Sets the minimum sample size.
    #[must_use]
    pub fn with_minimum_throughput(mut self, samples: usize) -> Self {
        self.minimum_throughput = samples;
        self
    }

    /// Sets the sampling window duration.
    #[must_use]
    pub fn with_sampling_duration(mut self, duration: Duration) -> Self {
        self.sampling_duration = duration;
        self
    }

    /// Sets the break duration.
    #[must_use]
    pub fn with_break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }

    /// Sets the HalfOpen trial count.
    #[must_use]
    pub fn with_trial_request_count(mut self, count: usize) -> Self {
        self.trial_request_count = count.max(1);
        self
    }

    /// Sets the partial-success item threshold for streams.
    #[must_use]
    pub fn with_partial_success_threshold(mut self, items: u64) -> Self {
        self.partial_success_threshold = items;
        self
    }

    /// Sets the failure classifier. Returning false records the completion
    /// as a success for circuit statistics.
    #[must_use]
    pub fn with_failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&FlowguardError) -> bool + Send + Sync + 'static,
    {
        self.failure_classifier = Arc::new(classifier);
        self
    }

    /// Returns true if `error` counts as a breaker failure.
    #[must_use]
    pub fn is_failure(&self, error: &FlowguardError) -> bool {
        (self.failure_classifier)(error)
    }
}

impl std::fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("failure_threshold_pct", &self.failure_threshold_pct)
            .field("minimum_throughput", &self.minimum_throughput)
            .field("sampling_duration", &self.sampling_duration)
            .field("break_duration", &self.break_duration)
            .field("trial_request_count", &self.trial_request_count)
            .field("partial_success_threshold", &self.partial_success_threshold)
            .finish_non_exhaustive()
    }
}

/// Statistics snapshot for inspection and event payloads.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Samples currently in the rolling window.
    pub sample_count: usize,
    /// Failure percentage over the window.
    pub failure_percentage: f64,
}

#[derive(Debug)]
enum StateKind {
    Closed,
    Open { since: Instant },
    HalfOpen { in_flight: usize },
}

#[derive(Debug)]
struct Inner {
    state: StateKind,
    window: SampleWindow,
}

enum Outcome {
    Success,
    Failure,
    /// Cancelled or dropped without completing; releases a trial slot but is
    /// never counted in the window.
    Abandoned,
}

/// A three-state failure-protection gate.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Creates a breaker guarding the named request type.
    #[must_use]
    pub fn new(name: &'static str, config: BreakerConfig) -> Arc<Self> {
        let window = SampleWindow::new(config.sampling_duration);
        Arc::new(Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: StateKind::Closed,
                window,
            }),
            sink: Arc::new(NoOpEventSink),
        })
    }

    /// Creates a breaker that emits `circuit.*` events to `sink`.
    #[must_use]
    pub fn with_event_sink(
        name: &'static str,
        config: BreakerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let window = SampleWindow::new(config.sampling_duration);
        Arc::new(Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: StateKind::Closed,
                window,
            }),
            sink,
        })
    }

    /// The request type this breaker guards.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The breaker configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Requests admission for one call.
    ///
    /// # Errors
    ///
    /// Returns [`FlowguardError::CircuitOpen`] while the circuit is Open or
    /// the HalfOpen trial batch is full. The inner call must not be invoked
    /// in that case.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Admission, FlowguardError> {
        let now = Instant::now();
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            match inner.state {
                StateKind::Closed => Some(false),
                StateKind::Open { since } => {
                    if now.duration_since(since) >= self.config.break_duration {
                        inner.state = StateKind::HalfOpen { in_flight: 1 };
                        transition = Some("circuit.half_open");
                        Some(true)
                    } else {
                        None
                    }
                }
                StateKind::HalfOpen { ref mut in_flight } => {
                    if *in_flight < self.config.trial_request_count {
                        *in_flight += 1;
                        Some(true)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(event) = transition {
            info!(breaker = self.name, "circuit entering half-open probe");
            self.emit(event);
        }

        match admitted {
            Some(trial) => Ok(Admission {
                breaker: self.clone(),
                trial,
                done: AtomicBool::new(false),
            }),
            None => Err(FlowguardError::CircuitOpen {
                request_type: self.name,
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            StateKind::Closed => CircuitState::Closed,
            StateKind::Open { .. } => CircuitState::Open,
            StateKind::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Returns a statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        inner.window.prune(Instant::now());
        BreakerStats {
            state: match inner.state {
                StateKind::Closed => CircuitState::Closed,
                StateKind::Open { .. } => CircuitState::Open,
                StateKind::HalfOpen { .. } => CircuitState::HalfOpen,
            },
            sample_count: inner.window.len(),
            failure_percentage: inner.window.failure_percentage(),
        }
    }

    /// Resets the breaker to Closed with empty counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = StateKind::Closed;
        inner.window.clear();
    }

    fn on_outcome(&self, trial: bool, outcome: &Outcome) {
        let now = Instant::now();
        let mut transition = None;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                StateKind::Closed => {
                    let success = match outcome {
                        Outcome::Success => true,
                        Outcome::Failure => false,
                        Outcome::Abandoned => return,
                    };
                    inner.window.record(success, now);
                    if inner.window.len() >= self.config.minimum_throughput
                        && inner.window.failure_percentage() >= self.config.failure_threshold_pct
                    {
                        inner.state = StateKind::Open { since: now };
                        inner.window.clear();
                        transition = Some("circuit.opened");
                    }
                }
                StateKind::HalfOpen { ref mut in_flight } => {
                    // Completions of calls admitted before the transition
                    // carry no trial slot and are not counted here.
                    if !trial {
                        return;
                    }
                    match outcome {
                        Outcome::Success => {
                            *in_flight = in_flight.saturating_sub(1);
                            if *in_flight == 0 {
                                inner.state = StateKind::Closed;
                                inner.window.clear();
                                transition = Some("circuit.closed");
                            }
                        }
                        Outcome::Failure => {
                            inner.state = StateKind::Open { since: now };
                            inner.window.clear();
                            transition = Some("circuit.opened");
                        }
                        Outcome::Abandoned => {
                            *in_flight = in_flight.saturating_sub(1);
                        }
                    }
                }
                StateKind::Open { .. } => {}
            }
        }

        match transition {
            Some(event @ "circuit.opened") => {
                warn!(breaker = self.name, "circuit opened");
                self.emit(event);
            }
            Some(event @ "circuit.closed") => {
                info!(breaker = self.name, "circuit closed after successful trials");
                self.emit(event);
            }
            _ => {}
        }
    }

    fn emit(&self, event: &str) {
        self.sink.try_emit(
            event,
            Some(serde_json::json!({ "request": self.name })),
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// An admitted call's permit. Exactly one outcome may be recorded; dropping
/// the permit unrecorded releases any trial slot without touching the
/// statistics.
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    done: AtomicBool,
}

impl Admission {
    /// Records the call as a success.
    pub fn record_success(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.breaker.on_outcome(self.trial, &Outcome::Success);
        }
    }

    /// Records the call as a failure.
    pub fn record_failure(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.breaker.on_outcome(self.trial, &Outcome::Failure);
        }
    }

    /// Releases the permit without recording; used for cancellation.
    pub fn record_cancelled(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.breaker.on_outcome(self.trial, &Outcome::Abandoned);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("breaker", &self.breaker.name())
            .field("trial", &self.trial)
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.breaker.on_outcome(self.trial, &Outcome::Abandoned);
        }
    }
}

/// Unary behavior gating the continuation through a shared breaker.
pub struct CircuitBreakerBehavior<R> {
    breaker: Arc<CircuitBreaker>,
    _request: std::marker::PhantomData<fn(R)>,
}

impl<R: Request> CircuitBreakerBehavior<R> {
    /// Creates a behavior with its own breaker for this request type.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self::from_breaker(CircuitBreaker::new(R::name(), config))
    }

    /// Creates a behavior over an existing shared breaker.
    #[must_use]
    pub fn from_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            _request: std::marker::PhantomData,
        }
    }

    /// The shared breaker, for inspection or sharing with a stream behavior.
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for CircuitBreakerBehavior<R> {
    async fn handle(
        &self,
        request: Arc<R>,
        next: Next<R>,
        ct: CancellationToken,
    ) -> Result<R::Response, FlowguardError> {
        let admission = self.breaker.try_acquire()?;
        match next.run(request, ct).await {
            Ok(response) => {
                admission.record_success();
                Ok(response)
            }
            Err(err) if err.is_cancelled() => {
                admission.record_cancelled();
                Err(err)
            }
            Err(err) => {
                if self.breaker.config().is_failure(&err) {
                    admission.record_failure();
                } else {
                    admission.record_success();
                }
                Err(err)
            }
        }
    }
}

/// Streaming behavior gating the continuation through a shared breaker.
///
/// The terminal outcome is observed through the decoupling runtime. A stream
/// failing after `partial_success_threshold` items records as success for
/// the statistics while the failure still reaches the caller.
pub struct StreamCircuitBreakerBehavior<R> {
    breaker: Arc<CircuitBreaker>,
    _request: std::marker::PhantomData<fn(R)>,
}

impl<R: StreamRequest> StreamCircuitBreakerBehavior<R> {
    /// Creates a behavior with its own breaker for this request type.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self::from_breaker(CircuitBreaker::new(R::name(), config))
    }

    /// Creates a behavior over an existing shared breaker.
    #[must_use]
    pub fn from_breaker(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            _request: std::marker::PhantomData,
        }
    }

    /// The shared breaker, for inspection.
    #[must_use]
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

impl<R: StreamRequest> StreamBehavior<R> for StreamCircuitBreakerBehavior<R> {
    fn handle(
        &self,
        request: Arc<R>,
        next: StreamNext<R>,
        ct: CancellationToken,
    ) -> ItemStream<R::Item> {
        let admission = match self.breaker.try_acquire() {
            Ok(admission) => Arc::new(admission),
            Err(err) => return Box::pin(futures::stream::once(async move { Err(err) })),
        };

        let inner = next.run(request, ct.clone());
        let items = Arc::new(AtomicU64::new(0));
        let breaker = self.breaker.clone();

        let items_hook = items.clone();
        let hooks = StreamHooks::new()
            .with_on_item(move |_: &R::Item| {
                items_hook.fetch_add(1, Ordering::Relaxed);
            })
            .with_on_complete(move |terminal| match terminal {
                None => admission.record_success(),
                Some(err) if err.is_cancelled() => admission.record_cancelled(),
                Some(err) => {
                    let yielded = items.load(Ordering::Relaxed);
                    let threshold = breaker.config().partial_success_threshold;
                    if threshold > 0 && yielded >= threshold {
                        admission.record_success();
                    } else if breaker.config().is_failure(err) {
                        admission.record_failure();
                    } else {
                        admission.record_success();
                    }
                }
            });

        decouple(inner, None, ct, hooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn trip_config() -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold_pct(50.0)
            .with_minimum_throughput(3)
            .with_break_duration(Duration::from_millis(50))
    }

    fn record_one(breaker: &Arc<CircuitBreaker>, success: bool) {
        let admission = breaker.try_acquire().expect("admitted");
        if success {
            admission.record_success();
        } else {
            admission.record_failure();
        }
    }

    #[test]
    fn test_three_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("Order", trip_config());

        record_one(&breaker, false);
        record_one(&breaker, false);
        assert_eq!(breaker.state(), CircuitState::Closed);

        record_one(&breaker, false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_circuit_rejects_without_admission() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }

        let err = breaker.try_acquire().unwrap_err();
        assert!(matches!(err, FlowguardError::CircuitOpen { .. }));
    }

    #[test]
    fn test_below_minimum_throughput_never_trips() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        record_one(&breaker, false);
        record_one(&breaker, false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_break_then_close_on_success() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));

        let trial = breaker.try_acquire().expect("trial admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        trial.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().sample_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_timer() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }
        std::thread::sleep(Duration::from_millis(60));

        let trial = breaker.try_acquire().expect("trial admitted");
        trial.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Freshly reopened: still rejecting.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_limits_concurrent_trials() {
        let breaker = CircuitBreaker::new(
            "Order",
            trip_config().with_trial_request_count(2),
        );
        for _ in 0..3 {
            record_one(&breaker, false);
        }
        std::thread::sleep(Duration::from_millis(60));

        let t1 = breaker.try_acquire().expect("first trial");
        let t2 = breaker.try_acquire().expect("second trial");
        assert!(matches!(
            breaker.try_acquire(),
            Err(FlowguardError::CircuitOpen { .. })
        ));

        t1.record_success();
        // One trial still in flight: stays half-open.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        t2.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_abandoned_trial_releases_slot_without_counting() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }
        std::thread::sleep(Duration::from_millis(60));

        {
            let trial = breaker.try_acquire().expect("trial admitted");
            trial.record_cancelled();
        }
        // Slot released: another probe is possible.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let trial = breaker.try_acquire().expect("second probe");
        trial.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_admission_does_not_skew_statistics() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..10 {
            let _admission = breaker.try_acquire().expect("admitted");
            // Dropped without recording.
        }
        assert_eq!(breaker.stats().sample_count, 0);
    }

    #[test]
    fn test_reset_returns_to_closed() {
        let breaker = CircuitBreaker::new("Order", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_classifier_can_exempt_errors() {
        let config = trip_config()
            .with_failure_classifier(|e| !matches!(e, FlowguardError::Fatal(_)));
        assert!(!config.is_failure(&FlowguardError::fatal("client bug")));
        assert!(config.is_failure(&FlowguardError::transient("backend down")));
    }

    #[tokio::test]
    async fn test_stream_partial_success_counts_leniently() {
        let breaker = CircuitBreaker::new(
            "Feed",
            trip_config().with_partial_success_threshold(3),
        );

        struct Feed;
        impl StreamRequest for Feed {
            type Item = u32;
            fn name() -> &'static str {
                "Feed"
            }
        }

        let behavior: StreamCircuitBreakerBehavior<Feed> =
            StreamCircuitBreakerBehavior::from_breaker(breaker.clone());

        let next = StreamNext::new(|_req: Arc<Feed>, _ct| -> ItemStream<u32> {
            Box::pin(futures::stream::iter([
                Ok(1),
                Ok(2),
                Ok(3),
                Err(FlowguardError::transient("late failure")),
            ]))
        });

        let results: Vec<_> = StreamBehavior::handle(
            &behavior,
            Arc::new(Feed),
            next,
            CancellationToken::new(),
        )
        .collect()
        .await;

        // Caller still observes the failure.
        assert!(matches!(
            results.last(),
            Some(Err(FlowguardError::Transient(_)))
        ));
        // Breaker bookkeeping treats it as a success.
        let stats = breaker.stats();
        assert_eq!(stats.sample_count, 1);
        assert_eq!(stats.failure_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_stream_rejected_while_open() {
        let breaker = CircuitBreaker::new("Feed", trip_config());
        for _ in 0..3 {
            record_one(&breaker, false);
        }

        struct Feed;
        impl StreamRequest for Feed {
            type Item = u32;
            fn name() -> &'static str {
                "Feed"
            }
        }

        let behavior: StreamCircuitBreakerBehavior<Feed> =
            StreamCircuitBreakerBehavior::from_breaker(breaker);

        let next = StreamNext::new(|_req: Arc<Feed>, _ct| -> ItemStream<u32> {
            panic!("inner continuation must not run while open");
        });

        let results: Vec<_> = StreamBehavior::handle(
            &behavior,
            Arc::new(Feed),
            next,
            CancellationToken::new(),
        )
        .collect()
        .await;

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FlowguardError::CircuitOpen { .. })
        ));
    }
}
