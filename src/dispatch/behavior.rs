//! Behavior traits and the continuation chain.
//!
//! Behaviors compose in a fixed, caller-declared order per request type.
//! Behavior *i* receives a [`Next`] continuation to behavior *i+1* (terminal
//! position: the bound handler) and invokes it exactly once per logical
//! attempt; a retrying behavior re-invokes the same continuation for each
//! attempt, which is why continuations are re-invocable and cheap to clone.

use crate::cancellation::CancellationToken;
use crate::errors::FlowguardError;
use crate::request::{Handler, ItemStream, Request, StreamHandler, StreamRequest};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future for a unary response.
pub type BoxResponseFuture<T> = Pin<Box<dyn Future<Output = Result<T, FlowguardError>> + Send>>;

/// Re-invocable continuation to the rest of a unary chain.
pub struct Next<R: Request> {
    inner: Arc<dyn Fn(Arc<R>, CancellationToken) -> BoxResponseFuture<R::Response> + Send + Sync>,
}

impl<R: Request> Clone for Next<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Request> Next<R> {
    /// Wraps a closure as a continuation. Mostly useful for testing
    /// behaviors in isolation; the dispatcher builds chains itself.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Arc<R>, CancellationToken) -> BoxResponseFuture<R::Response> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Invokes the rest of the chain.
    pub fn run(&self, request: Arc<R>, ct: CancellationToken) -> BoxResponseFuture<R::Response> {
        (self.inner)(request, ct)
    }
}

/// Re-invocable continuation to the rest of a streaming chain.
pub struct StreamNext<R: StreamRequest> {
    inner: Arc<dyn Fn(Arc<R>, CancellationToken) -> ItemStream<R::Item> + Send + Sync>,
}

impl<R: StreamRequest> Clone for StreamNext<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: StreamRequest> StreamNext<R> {
    /// Wraps a closure as a stream continuation.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Arc<R>, CancellationToken) -> ItemStream<R::Item> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Invokes the rest of the chain, producing the inner stream.
    pub fn run(&self, request: Arc<R>, ct: CancellationToken) -> ItemStream<R::Item> {
        (self.inner)(request, ct)
    }
}

/// A cross-cutting wrapper around a unary request's processing step.
#[async_trait]
pub trait Behavior<R: Request>: Send + Sync {
    /// Handles the request, delegating to `next` for the rest of the chain.
    async fn handle(
        &self,
        request: Arc<R>,
        next: Next<R>,
        ct: CancellationToken,
    ) -> Result<R::Response, FlowguardError>;
}

/// A cross-cutting wrapper around a streaming request's processing step.
pub trait StreamBehavior<R: StreamRequest>: Send + Sync {
    /// Handles the request, delegating to `next` for the inner stream.
    fn handle(
        &self,
        request: Arc<R>,
        next: StreamNext<R>,
        ct: CancellationToken,
    ) -> ItemStream<R::Item>;
}

/// Folds an ordered behavior list and a terminal handler into one
/// continuation. Behavior 0 runs outermost.
pub(crate) fn compose<R: Request>(
    handler: Arc<dyn Handler<R>>,
    behaviors: &[Arc<dyn Behavior<R>>],
) -> Next<R> {
    let mut next = Next::new(move |request: Arc<R>, ct: CancellationToken| {
        let handler = handler.clone();
        Box::pin(async move { handler.handle(&request, &ct).await }) as BoxResponseFuture<_>
    });

    for behavior in behaviors.iter().rev() {
        let behavior = behavior.clone();
        let tail = next.clone();
        next = Next::new(move |request: Arc<R>, ct: CancellationToken| {
            let behavior = behavior.clone();
            let tail = tail.clone();
            Box::pin(async move { behavior.handle(request, tail, ct).await })
                as BoxResponseFuture<_>
        });
    }

    next
}

/// Streaming counterpart of [`compose`].
pub(crate) fn compose_stream<R: StreamRequest>(
    handler: Arc<dyn StreamHandler<R>>,
    behaviors: &[Arc<dyn StreamBehavior<R>>],
) -> StreamNext<R> {
    let mut next = StreamNext::new(move |request: Arc<R>, ct: CancellationToken| {
        handler.handle(request, ct)
    });

    for behavior in behaviors.iter().rev() {
        let behavior = behavior.clone();
        let tail = next.clone();
        next = StreamNext::new(move |request: Arc<R>, ct: CancellationToken| {
            behavior.handle(request, tail.clone(), ct)
        });
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Greet(String);

    impl Request for Greet {
        type Response = String;

        fn name() -> &'static str {
            "Greet"
        }
    }

    struct GreetHandler;

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn handle(
            &self,
            request: &Greet,
            _ct: &CancellationToken,
        ) -> Result<String, FlowguardError> {
            Ok(format!("hello {}", request.0))
        }
    }

    struct TaggingBehavior {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Behavior<Greet> for TaggingBehavior {
        async fn handle(
            &self,
            request: Arc<Greet>,
            next: Next<Greet>,
            ct: CancellationToken,
        ) -> Result<String, FlowguardError> {
            self.order.lock().push(self.tag);
            next.run(request, ct).await
        }
    }

    #[tokio::test]
    async fn test_behaviors_run_in_declared_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let behaviors: Vec<Arc<dyn Behavior<Greet>>> = vec![
            Arc::new(TaggingBehavior {
                tag: "outer",
                order: order.clone(),
            }),
            Arc::new(TaggingBehavior {
                tag: "inner",
                order: order.clone(),
            }),
        ];

        let chain = compose(Arc::new(GreetHandler), &behaviors);
        let response = chain
            .run(Arc::new(Greet("world".to_string())), CancellationToken::new())
            .await
            .expect("handler succeeds");

        assert_eq!(response, "hello world");
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_continuation_is_reinvocable() {
        let chain = compose(Arc::new(GreetHandler), &[]);
        let request = Arc::new(Greet("again".to_string()));

        let first = chain.run(request.clone(), CancellationToken::new()).await;
        let second = chain.run(request, CancellationToken::new()).await;

        assert_eq!(first.expect("first"), second.expect("second"));
    }

    struct Ticks(u32);

    impl StreamRequest for Ticks {
        type Item = u32;

        fn name() -> &'static str {
            "Ticks"
        }
    }

    struct TicksHandler;

    impl StreamHandler<Ticks> for TicksHandler {
        fn handle(&self, request: Arc<Ticks>, _ct: CancellationToken) -> ItemStream<u32> {
            Box::pin(futures::stream::iter((0..request.0).map(Ok)))
        }
    }

    struct DoublingBehavior;

    impl StreamBehavior<Ticks> for DoublingBehavior {
        fn handle(
            &self,
            request: Arc<Ticks>,
            next: StreamNext<Ticks>,
            ct: CancellationToken,
        ) -> ItemStream<u32> {
            Box::pin(next.run(request, ct).map(|item| item.map(|n| n * 2)))
        }
    }

    #[tokio::test]
    async fn test_stream_chain_transforms_items() {
        let behaviors: Vec<Arc<dyn StreamBehavior<Ticks>>> = vec![Arc::new(DoublingBehavior)];
        let chain = compose_stream(Arc::new(TicksHandler), &behaviors);

        let items: Vec<u32> = chain
            .run(Arc::new(Ticks(4)), CancellationToken::new())
            .map(|item| item.expect("no errors"))
            .collect()
            .await;

        assert_eq!(items, vec![0, 2, 4, 6]);
    }
}
