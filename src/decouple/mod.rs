//! Producer/consumer decoupling runtime.
//!
//! Streaming behaviors cannot wrap error handling around the production
//! points of a lazy sequence, so they split the stream instead: a background
//! task drains the inner stream with full error handling and writes items to
//! an internal queue, and the caller-facing stream reads from the queue and
//! re-raises the terminal outcome. Items are delivered in exact production
//! order; cancellation propagates to both sides; a background-task fault
//! unrelated to the inner stream surfaces as
//! [`FlowguardError::StreamingRuntime`].

use crate::cancellation::CancellationToken;
use crate::errors::FlowguardError;
use crate::request::ItemStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Observation hooks invoked from the producer task, outside the inner
/// stream's own production scope.
pub struct StreamHooks<T> {
    on_item: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    on_complete: Option<Arc<dyn Fn(Option<&FlowguardError>) + Send + Sync>>,
}

impl<T> Default for StreamHooks<T> {
    fn default() -> Self {
        Self {
            on_item: None,
            on_complete: None,
        }
    }
}

impl<T> Clone for StreamHooks<T> {
    fn clone(&self) -> Self {
        Self {
            on_item: self.on_item.clone(),
            on_complete: self.on_complete.clone(),
        }
    }
}

impl<T> StreamHooks<T> {
    /// Creates empty hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a hook invoked for every item the inner stream produces.
    #[must_use]
    pub fn with_on_item<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_item = Some(Arc::new(hook));
        self
    }

    /// Sets a hook invoked once with the terminal outcome: `None` on
    /// successful completion, `Some(err)` on failure or cancellation.
    #[must_use]
    pub fn with_on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&FlowguardError>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(hook));
        self
    }
}

enum ItemSender<T> {
    Bounded(mpsc::Sender<Result<T, FlowguardError>>),
    Unbounded(mpsc::UnboundedSender<Result<T, FlowguardError>>),
}

impl<T> ItemSender<T> {
    /// Sends an item; suspends while a bounded queue is full. Errors when the
    /// consumer side has been dropped.
    async fn send(&self, item: Result<T, FlowguardError>) -> Result<(), ()> {
        match self {
            Self::Bounded(tx) => tx.send(item).await.map_err(|_| ()),
            Self::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        }
    }

    /// Resolves once the consumer side has been dropped.
    async fn closed(&self) {
        match self {
            Self::Bounded(tx) => tx.closed().await,
            Self::Unbounded(tx) => tx.closed().await,
        }
    }
}

enum ItemReceiver<T> {
    Bounded(mpsc::Receiver<Result<T, FlowguardError>>),
    Unbounded(mpsc::UnboundedReceiver<Result<T, FlowguardError>>),
}

impl<T> ItemReceiver<T> {
    async fn recv(&mut self) -> Option<Result<T, FlowguardError>> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

struct ConsumerState<T> {
    rx: ItemReceiver<T>,
    producer: Option<JoinHandle<()>>,
    ct: CancellationToken,
}

/// Decouples `inner` behind a background producer task.
///
/// `capacity` bounds the internal queue; `None` makes it unbounded. The
/// returned stream yields the inner items in production order, then the
/// terminal failure (if any). Cancellation ends the stream without an error
/// item and stops the producer promptly.
pub fn decouple<T: Send + 'static>(
    inner: ItemStream<T>,
    capacity: Option<usize>,
    ct: CancellationToken,
    hooks: StreamHooks<T>,
) -> ItemStream<T> {
    let (tx, rx) = match capacity {
        Some(cap) => {
            let (tx, rx) = mpsc::channel(cap.max(1));
            (ItemSender::Bounded(tx), ItemReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (ItemSender::Unbounded(tx), ItemReceiver::Unbounded(rx))
        }
    };

    let producer_ct = ct.clone();
    let producer = tokio::spawn(async move {
        let mut inner = inner;
        let outcome: Option<FlowguardError> = loop {
            tokio::select! {
                () = producer_ct.cancelled() => {
                    debug!("stream producer stopping: cancellation observed");
                    break Some(FlowguardError::cancelled(producer_ct.reason()));
                }
                () = tx.closed() => {
                    debug!("stream producer stopping: consumer dropped");
                    break Some(FlowguardError::cancelled(Some(
                        "consumer dropped the stream".to_string(),
                    )));
                }
                item = inner.next() => match item {
                    None => break None,
                    Some(Ok(value)) => {
                        if let Some(hook) = &hooks.on_item {
                            hook(&value);
                        }
                        if tx.send(Ok(value)).await.is_err() {
                            break Some(FlowguardError::cancelled(Some(
                                "consumer dropped the stream".to_string(),
                            )));
                        }
                    }
                    Some(Err(err)) => break Some(err),
                }
            }
        };

        if let Some(hook) = &hooks.on_complete {
            hook(outcome.as_ref());
        }
        // Cancellation is not an error condition for the consumer.
        if let Some(err) = outcome {
            if !err.is_cancelled() {
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    let state = ConsumerState {
        rx,
        producer: Some(producer),
        ct,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        tokio::select! {
            () = state.ct.cancelled() => None,
            item = state.rx.recv() => match item {
                Some(item) => Some((item, state)),
                None => match state.producer.take() {
                    Some(handle) => match handle.await {
                        Ok(()) => None,
                        Err(join_err) => Some((
                            Err(FlowguardError::streaming_runtime(join_err.to_string())),
                            state,
                        )),
                    },
                    None => None,
                },
            },
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_stream(n: u32) -> ItemStream<u32> {
        Box::pin(futures::stream::iter((0..n).map(Ok)))
    }

    fn failing_stream(ok_items: u32) -> ItemStream<u32> {
        Box::pin(
            futures::stream::iter(0..=ok_items).map(move |i| {
                if i < ok_items {
                    Ok(i)
                } else {
                    Err(FlowguardError::transient("stream blew up"))
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_items_delivered_in_production_order() {
        let ct = CancellationToken::new();
        let outer = decouple(counting_stream(50), Some(4), ct, StreamHooks::new());

        let items: Vec<u32> = outer.map(|r| r.expect("all items ok")).collect().await;
        assert_eq!(items, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unbounded_queue_delivers_all_items() {
        let ct = CancellationToken::new();
        let outer = decouple(counting_stream(200), None, ct, StreamHooks::new());

        let items: Vec<u32> = outer.map(|r| r.expect("all items ok")).collect().await;
        assert_eq!(items.len(), 200);
    }

    #[tokio::test]
    async fn test_terminal_failure_reraised_after_items() {
        let ct = CancellationToken::new();
        let outer = decouple(failing_stream(3), Some(8), ct, StreamHooks::new());

        let results: Vec<Result<u32, FlowguardError>> = outer.collect().await;
        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(Result::is_ok));
        assert!(matches!(results[3], Err(FlowguardError::Transient(_))));
    }

    #[tokio::test]
    async fn test_hooks_observe_items_and_outcome() {
        let ct = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let outcome: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let seen_hook = seen.clone();
        let outcome_hook = outcome.clone();
        let hooks = StreamHooks::new()
            .with_on_item(move |_: &u32| {
                seen_hook.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_complete(move |err| {
                *outcome_hook.lock() = Some(match err {
                    None => "ok".to_string(),
                    Some(e) => e.kind().to_string(),
                });
            });

        let outer = decouple(failing_stream(5), Some(8), ct, hooks);
        let _results: Vec<_> = outer.collect().await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.lock().clone(), Some("transient".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_delivery() {
        let ct = CancellationToken::new();
        // An endless producer.
        let inner: ItemStream<u32> = Box::pin(futures::stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Some((Ok(n), n + 1))
        }));

        let mut outer = decouple(inner, Some(4), ct.clone(), StreamHooks::new());

        let first = outer.next().await;
        assert!(matches!(first, Some(Ok(0))));

        ct.cancel("enough");

        // Drain whatever remains; the stream must end without further items
        // once cancellation is observed, and must not hang.
        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(2), outer.collect::<Vec<_>>())
            .await
            .expect("stream should end after cancellation");
        assert!(rest.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_parked_producer() {
        let ct = CancellationToken::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_hook = finished.clone();
        let hooks = StreamHooks::new().with_on_complete(move |_| {
            finished_hook.fetch_add(1, Ordering::SeqCst);
        });
        // An inner stream that never yields; only the closed-channel signal
        // can wake the producer.
        let inner: ItemStream<u32> =
            Box::pin(futures::stream::pending::<Result<u32, FlowguardError>>());

        let outer = decouple(inner, Some(4), ct, hooks);
        drop(outer);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while finished.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_producer_panic_surfaces_as_streaming_runtime() {
        let ct = CancellationToken::new();
        let inner: ItemStream<u32> = Box::pin(futures::stream::once(async {
            panic!("unexpected internal fault");
        }));

        let results: Vec<_> = decouple(inner, Some(4), ct, StreamHooks::new())
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FlowguardError::StreamingRuntime { .. })
        ));
    }
}
