//! Request and handler contracts.
//!
//! A request is uniquely typed to one response type; handlers are owned by
//! the registration layer and invoked by reference from the pipeline.

use crate::cancellation::CancellationToken;
use crate::errors::FlowguardError;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// A lazy, possibly-infinite sequence of response items.
pub type ItemStream<T> = Pin<Box<dyn Stream<Item = Result<T, FlowguardError>> + Send>>;

/// Marker for a unary request, typed to exactly one response type.
pub trait Request: Send + Sync + 'static {
    /// The response produced by this request's handler.
    type Response: Send + 'static;

    /// Stable name used in errors and event payloads.
    #[must_use]
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Marker for a streaming request whose handler produces a lazy sequence of
/// items.
pub trait StreamRequest: Send + Sync + 'static {
    /// The item type of the produced sequence.
    type Item: Send + 'static;

    /// Stable name used in errors and event payloads.
    #[must_use]
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A handler for a unary request.
#[async_trait]
pub trait Handler<R: Request>: Send + Sync {
    /// Handles the request, producing a response or an error.
    async fn handle(
        &self,
        request: &R,
        ct: &CancellationToken,
    ) -> Result<R::Response, FlowguardError>;
}

/// A handler for a streaming request.
pub trait StreamHandler<R: StreamRequest>: Send + Sync {
    /// Handles the request, producing a lazy item sequence.
    fn handle(&self, request: Arc<R>, ct: CancellationToken) -> ItemStream<R::Item>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    impl Request for Ping {
        type Response = String;

        fn name() -> &'static str {
            "Ping"
        }
    }

    struct Count;

    impl StreamRequest for Count {
        type Item = u32;
    }

    #[test]
    fn test_request_name_override() {
        assert_eq!(Ping::name(), "Ping");
    }

    #[test]
    fn test_stream_request_name_defaults_to_type_name() {
        assert!(Count::name().contains("Count"));
    }
}
