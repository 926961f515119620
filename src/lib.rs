//! # Flowguard
//!
//! An in-process request-dispatch pipeline with built-in resilience.
//!
//! Flowguard routes typed requests through ordered behavior chains to their
//! registered handlers, with support for:
//!
//! - **Typed dispatch**: Each request type binds one handler and one
//!   behavior chain, composed at build time
//! - **Retry with backoff**: Fixed, exponential, and jittered strategies
//!   with a total time budget
//! - **Circuit breaking**: Failure-rate tripping with half-open trial
//!   admission, for unary and streaming requests alike
//! - **Backpressure**: Watermark-based flow control with buffer, drop,
//!   throttle, and sample strategies
//! - **Stream health monitoring**: Throughput, stall, memory, and error
//!   rate tracking with escalating verdicts
//! - **Cancellation handling**: Cooperative tokens observed at every await
//!   point in the pipeline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowguard::prelude::*;
//!
//! // Bind a handler and a resilience chain to a request type
//! let dispatcher = Dispatcher::builder()
//!     .register_handler::<FetchUser>(Arc::new(FetchUserHandler))
//!     .register_behavior(Arc::new(RetryBehavior::<FetchUser>::new(
//!         RetryPolicy::new().with_max_retry_attempts(3),
//!     )))
//!     .register_behavior(Arc::new(CircuitBreakerBehavior::<FetchUser>::new(
//!         BreakerConfig::new(),
//!     )))
//!     .build()?;
//!
//! // Dispatch
//! let user = dispatcher.send(FetchUser { id }, &ct).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod backpressure;
pub mod breaker;
pub mod cancellation;
pub mod decouple;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod health;
pub mod request;
pub mod retry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backpressure::{
        BackpressureBehavior, BackpressureConfig, BackpressureStrategy, PressureEvent,
    };
    pub use crate::breaker::{
        BreakerConfig, CircuitBreaker, CircuitBreakerBehavior, CircuitState,
        StreamCircuitBreakerBehavior,
    };
    pub use crate::cancellation::{sleep_cancellable, CancellationToken};
    pub use crate::decouple::{decouple, StreamHooks};
    pub use crate::dispatch::{
        Behavior, Dispatcher, DispatcherBuilder, Next, StreamBehavior, StreamNext,
    };
    pub use crate::errors::FlowguardError;
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::health::{
        HealthMonitorBehavior, HealthReporter, HealthStatus, HealthThresholds,
        StreamHealthMonitor,
    };
    pub use crate::request::{Handler, ItemStream, Request, StreamHandler, StreamRequest};
    pub use crate::retry::{BackoffStrategy, RetryBehavior, RetryPolicy};
}
