//! Pipeline composition and dispatch.
//!
//! The dispatcher resolves a request type to its ordered behavior chain and
//! bound handler, then invokes the chain. It holds no resilience logic of
//! its own; retry, circuit breaking, backpressure, and health monitoring are
//! behaviors composed into the chain.

mod behavior;
mod registry;


pub use behavior::{Behavior, BoxResponseFuture, Next, StreamBehavior, StreamNext};
pub use registry::DispatcherBuilder;

use crate::cancellation::CancellationToken;
use crate::errors::FlowguardError;
use crate::request::{ItemStream, Request, StreamRequest};
use dashmap::DashMap;
use registry::{StreamSlot, UnarySlot};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

type BoxedEntry = Box<dyn Any + Send + Sync>;

/// The only entry points into the pipeline core: unary `send` and streaming
/// `create_stream`.
pub struct Dispatcher {
    unary: DashMap<TypeId, BoxedEntry>,
    streaming: DashMap<TypeId, BoxedEntry>,
}

impl Dispatcher {
    pub(crate) fn from_parts(
        unary: HashMap<TypeId, BoxedEntry>,
        streaming: HashMap<TypeId, BoxedEntry>,
    ) -> Self {
        Self {
            unary: unary.into_iter().collect(),
            streaming: streaming.into_iter().collect(),
        }
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Dispatches a unary request through its behavior chain.
    ///
    /// # Errors
    ///
    /// [`FlowguardError::HandlerNotFound`] if no handler is registered for
    /// `R`; otherwise whatever the chain propagates.
    pub async fn send<R: Request>(
        &self,
        request: R,
        ct: &CancellationToken,
    ) -> Result<R::Response, FlowguardError> {
        let chain = {
            let entry = self
                .unary
                .get(&TypeId::of::<R>())
                .ok_or(FlowguardError::HandlerNotFound(R::name()))?;
            let slot = entry
                .value()
                .downcast_ref::<UnarySlot<R>>()
                .ok_or_else(|| {
                    FlowguardError::Internal(format!(
                        "dispatch slot for '{}' has the wrong type",
                        R::name()
                    ))
                })?;
            slot.chain.clone()
        };

        let invocation = Uuid::new_v4();
        debug!(request = R::name(), %invocation, "dispatching unary request");
        chain.run(std::sync::Arc::new(request), ct.clone()).await
    }

    /// Dispatches a streaming request, producing its lazy item sequence.
    ///
    /// A missing registration surfaces as a one-item stream carrying
    /// [`FlowguardError::HandlerNotFound`]; no behavior is entered.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
        ct: &CancellationToken,
    ) -> ItemStream<R::Item> {
        let chain = {
            let Some(entry) = self.streaming.get(&TypeId::of::<R>()) else {
                return Box::pin(futures::stream::once(async {
                    Err(FlowguardError::HandlerNotFound(R::name()))
                }));
            };
            match entry.value().downcast_ref::<StreamSlot<R>>() {
                Some(slot) => slot.chain.clone(),
                None => {
                    let message =
                        format!("dispatch slot for '{}' has the wrong type", R::name());
                    return Box::pin(futures::stream::once(async move {
                        Err(FlowguardError::Internal(message))
                    }));
                }
            }
        };

        let invocation = Uuid::new_v4();
        debug!(request = R::name(), %invocation, "dispatching stream request");
        chain.run(std::sync::Arc::new(request), ct.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Handler, StreamHandler};
    use async_trait::async_trait;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Ping;

    impl Request for Ping {
        type Response = &'static str;

        fn name() -> &'static str {
            "Ping"
        }
    }

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(
            &self,
            _request: &Ping,
            _ct: &CancellationToken,
        ) -> Result<&'static str, FlowguardError> {
            Ok("pong")
        }
    }

    struct Nums(u32);

    impl StreamRequest for Nums {
        type Item = u32;

        fn name() -> &'static str {
            "Nums"
        }
    }

    struct NumsHandler;

    impl StreamHandler<Nums> for NumsHandler {
        fn handle(&self, request: Arc<Nums>, _ct: CancellationToken) -> ItemStream<u32> {
            Box::pin(futures::stream::iter((0..request.0).map(Ok)))
        }
    }

    #[tokio::test]
    async fn test_send_resolves_handler() {
        let dispatcher = Dispatcher::builder()
            .register_handler::<Ping>(Arc::new(PingHandler))
            .build()
            .expect("valid registry");

        let response = dispatcher
            .send(Ping, &CancellationToken::new())
            .await
            .expect("handler runs");
        assert_eq!(response, "pong");
    }

    #[tokio::test]
    async fn test_send_unregistered_is_handler_not_found() {
        let dispatcher = Dispatcher::builder().build().expect("empty registry");

        let err = dispatcher
            .send(Ping, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowguardError::HandlerNotFound("Ping")));
    }

    #[tokio::test]
    async fn test_create_stream_resolves_handler() {
        let dispatcher = Dispatcher::builder()
            .register_stream_handler::<Nums>(Arc::new(NumsHandler))
            .build()
            .expect("valid registry");

        let items: Vec<u32> = dispatcher
            .create_stream(Nums(5), &CancellationToken::new())
            .map(|item| item.expect("no errors"))
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_create_stream_unregistered_yields_handler_not_found() {
        let dispatcher = Dispatcher::builder().build().expect("empty registry");

        let results: Vec<_> = dispatcher
            .create_stream(Nums(5), &CancellationToken::new())
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FlowguardError::HandlerNotFound("Nums"))
        ));
    }
}
