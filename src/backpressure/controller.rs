//! The pressure-regulated queue and its stream behavior.

use super::{
    BackpressureConfig, BackpressureMetrics, BackpressureSnapshot, BackpressureStrategy,
    PressureEvent,
};
use crate::cancellation::{sleep_cancellable, CancellationToken};
use crate::dispatch::{StreamBehavior, StreamNext};
use crate::errors::FlowguardError;
use crate::request::{ItemStream, StreamRequest};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Result of offering one item to the regulator.
#[derive(Debug)]
pub(crate) enum OfferOutcome {
    /// The item was buffered.
    Accepted,
    /// The item was dropped or sampled out; production continues.
    Discarded,
    /// The item was buffered and the producer must pause before the next
    /// production.
    Throttled(std::time::Duration),
    /// The buffer hit hard capacity; the stream must fail with this error.
    Overflow(FlowguardError),
}

struct QueueState<T> {
    items: VecDeque<Result<T, FlowguardError>>,
    engaged: bool,
    sample_counter: u64,
    closed: bool,
}

/// Shared between the producer task (which offers) and the consumer stream
/// (which takes). Hysteresis lives here: `engaged` flips on at the high
/// watermark and off only below the low watermark.
pub(crate) struct Regulator<T> {
    config: BackpressureConfig,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    metrics: Arc<BackpressureMetrics>,
}

impl<T> Regulator<T> {
    pub(crate) fn new(config: BackpressureConfig, metrics: Arc<BackpressureMetrics>) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                engaged: false,
                sample_counter: 0,
                closed: false,
            }),
            notify: Notify::new(),
            metrics,
        }
    }

    /// Offers one produced item, applying the engage rule and, while
    /// engaged, the configured mitigation strategy.
    pub(crate) fn offer(&self, value: T) -> OfferOutcome {
        let capacity = self.config.max_buffer_size;
        let mut events: Vec<PressureEvent> = Vec::new();
        let outcome = {
            let mut st = self.state.lock();
            let occupancy = st.items.len();
            let snapshot = BackpressureSnapshot {
                occupancy,
                capacity,
                engaged: st.engaged,
            };
            if !st.engaged
                && (occupancy as f64 >= self.config.high_threshold()
                    || self.config.trigger_fires(&snapshot))
            {
                st.engaged = true;
                events.push(PressureEvent::Engaged(BackpressureSnapshot {
                    engaged: true,
                    ..snapshot
                }));
            }
            let outcome = if st.engaged {
                match self.config.strategy {
                    BackpressureStrategy::Buffer => {
                        if occupancy >= capacity {
                            events.push(PressureEvent::Overflow {
                                occupancy,
                                capacity,
                            });
                            OfferOutcome::Overflow(FlowguardError::ResourceExhausted {
                                occupancy,
                                capacity,
                            })
                        } else {
                            st.items.push_back(Ok(value));
                            OfferOutcome::Accepted
                        }
                    }
                    BackpressureStrategy::Drop { prefer_newer } => {
                        if occupancy >= capacity {
                            self.metrics.record_dropped();
                            events.push(PressureEvent::ItemDropped { occupancy });
                            if prefer_newer {
                                st.items.pop_front();
                                st.items.push_back(Ok(value));
                                OfferOutcome::Accepted
                            } else {
                                OfferOutcome::Discarded
                            }
                        } else {
                            st.items.push_back(Ok(value));
                            OfferOutcome::Accepted
                        }
                    }
                    BackpressureStrategy::Throttle { max_delay } => {
                        st.items.push_back(Ok(value));
                        let delay = self.config.throttle_delay(st.items.len(), max_delay);
                        if delay.is_zero() {
                            OfferOutcome::Accepted
                        } else {
                            events.push(PressureEvent::ProducerThrottled { delay });
                            OfferOutcome::Throttled(delay)
                        }
                    }
                    BackpressureStrategy::Sample { rate } => {
                        st.sample_counter += 1;
                        if rate > 1 && st.sample_counter % u64::from(rate) != 0 {
                            self.metrics.record_sampled_out();
                            events.push(PressureEvent::ItemSampledOut);
                            OfferOutcome::Discarded
                        } else {
                            st.items.push_back(Ok(value));
                            OfferOutcome::Accepted
                        }
                    }
                }
            } else {
                st.items.push_back(Ok(value));
                OfferOutcome::Accepted
            };
            self.metrics.record_produced(st.items.len());
            outcome
        };
        self.notify.notify_one();
        for event in &events {
            match event {
                PressureEvent::Engaged(snapshot) => {
                    tracing::warn!(
                        occupancy = snapshot.occupancy,
                        capacity = snapshot.capacity,
                        "backpressure engaged"
                    );
                }
                PressureEvent::Overflow {
                    occupancy,
                    capacity,
                } => {
                    tracing::error!(occupancy, capacity, "stream buffer overflow");
                }
                _ => {}
            }
            self.config.notify_handler(event);
        }
        outcome
    }

    /// Takes the next buffered item, waiting for production. Returns `None`
    /// when the regulator is closed and drained, or on cancellation.
    pub(crate) async fn take(&self, ct: &CancellationToken) -> Option<Result<T, FlowguardError>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state.lock();
                if let Some(item) = st.items.pop_front() {
                    let occupancy = st.items.len();
                    let mut disengaged = None;
                    if st.engaged && (occupancy as f64) < self.config.low_threshold() {
                        let snapshot = BackpressureSnapshot {
                            occupancy,
                            capacity: self.config.max_buffer_size,
                            engaged: true,
                        };
                        if !self.config.trigger_fires(&snapshot) {
                            st.engaged = false;
                            disengaged = Some(BackpressureSnapshot {
                                engaged: false,
                                ..snapshot
                            });
                        }
                    }
                    drop(st);
                    if let Some(snapshot) = disengaged {
                        tracing::debug!(occupancy = snapshot.occupancy, "backpressure disengaged");
                        self.config.notify_handler(&PressureEvent::Disengaged(snapshot));
                    }
                    return Some(item);
                }
                if st.closed {
                    return None;
                }
            }
            tokio::select! {
                () = notified => {}
                () = ct.cancelled() => return None,
            }
        }
    }

    /// Fails the stream: the error becomes the final queued item.
    pub(crate) fn fail(&self, err: FlowguardError) {
        {
            let mut st = self.state.lock();
            if !st.closed {
                st.items.push_back(Err(err));
                st.closed = true;
            }
        }
        self.notify.notify_one();
    }

    /// Marks production complete. Idempotent.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Closes the regulator even if the producer task unwinds.
struct CloseOnDrop<T>(Arc<Regulator<T>>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Inserts a pressure-regulated buffer between the inner stream's producer
/// and the outer consumer. The inner stream is drained by a spawned task;
/// the outer stream drains the regulator at the consumer's pace.
pub struct BackpressureBehavior {
    config: BackpressureConfig,
    metrics: Arc<BackpressureMetrics>,
}

impl BackpressureBehavior {
    /// Creates a behavior with the given configuration.
    #[must_use]
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(BackpressureMetrics::default()),
        }
    }

    /// Counters aggregated across every stream this behavior regulated.
    #[must_use]
    pub fn metrics(&self) -> Arc<BackpressureMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Stops the producer task when the consumer side is dropped without
/// cancelling the outer token.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel("consumer dropped the stream");
    }
}

struct ConsumerState<T> {
    regulator: Arc<Regulator<T>>,
    ct: CancellationToken,
    producer: Option<JoinHandle<()>>,
    _stop: CancelOnDrop,
}

impl<R: StreamRequest> StreamBehavior<R> for BackpressureBehavior {
    fn handle(
        &self,
        request: Arc<R>,
        next: StreamNext<R>,
        ct: CancellationToken,
    ) -> ItemStream<R::Item> {
        let regulator = Arc::new(Regulator::new(self.config.clone(), Arc::clone(&self.metrics)));
        let mut inner = next.run(request, ct.clone());
        let stop = CancellationToken::new();
        let producer = {
            let regulator = Arc::clone(&regulator);
            let ct = ct.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let _guard = CloseOnDrop(Arc::clone(&regulator));
                loop {
                    let item = tokio::select! {
                        () = ct.cancelled() => break,
                        () = stop.cancelled() => break,
                        item = inner.next() => item,
                    };
                    match item {
                        None => break,
                        Some(Ok(value)) => match regulator.offer(value) {
                            OfferOutcome::Accepted | OfferOutcome::Discarded => {}
                            OfferOutcome::Throttled(delay) => {
                                if sleep_cancellable(delay, &ct).await.is_err() {
                                    break;
                                }
                            }
                            OfferOutcome::Overflow(err) => {
                                regulator.fail(err);
                                break;
                            }
                        },
                        Some(Err(err)) => {
                            regulator.fail(err);
                            break;
                        }
                    }
                }
            })
        };
        let state = ConsumerState {
            regulator,
            ct,
            producer: Some(producer),
            _stop: CancelOnDrop(stop),
        };
        Box::pin(futures::stream::unfold(state, |mut state| async move {
            if let Some(item) = state.regulator.take(&state.ct).await {
                return Some((item, state));
            }
            if state.ct.is_cancelled() {
                return None;
            }
            if let Some(handle) = state.producer.take() {
                if let Err(join_err) = handle.await {
                    if join_err.is_panic() {
                        let err = FlowguardError::streaming_runtime(format!(
                            "stream producer panicked: {join_err}"
                        ));
                        return Some((Err(err), state));
                    }
                }
            }
            None
        }))
    }
}
