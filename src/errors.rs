//! Error taxonomy for the flowguard pipeline.
//!
//! Every component recovers only what it explicitly owns; all other failures
//! propagate unchanged so that nested retries and breakers downstream can
//! classify the original error. `StreamingRuntime` is the one deliberate
//! wrapper: it marks infrastructure faults in the producer/consumer runtime
//! as distinct from handler failures.

use thiserror::Error;

/// The main error type for flowguard operations.
#[derive(Debug, Error)]
pub enum FlowguardError {
    /// No handler was registered for the request type. Fatal, never retried.
    #[error("no handler registered for request type '{0}'")]
    HandlerNotFound(&'static str),

    /// A failure classified as retryable by policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure classified as non-retryable; propagated immediately.
    #[error("{0}")]
    Fatal(String),

    /// The circuit breaker rejected the call without invoking the handler.
    #[error("circuit open for request type '{request_type}'")]
    CircuitOpen {
        /// The request type guarded by the breaker.
        request_type: &'static str,
    },

    /// The backpressure buffer hit hard capacity with no mitigation possible.
    #[error("stream buffer exhausted at {occupancy}/{capacity} items")]
    ResourceExhausted {
        /// Buffer occupancy when the overflow occurred.
        occupancy: usize,
        /// Configured buffer capacity.
        capacity: usize,
    },

    /// The decoupling runtime's background task faulted independently of the
    /// inner stream. Wraps the cause so infrastructure faults stay
    /// distinguishable from handler faults.
    #[error("streaming runtime fault: {message}")]
    StreamingRuntime {
        /// Description of the underlying fault.
        message: String,
    },

    /// Cooperative cancellation. Not a failure: never retried and never
    /// recorded against the circuit breaker.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowguardError {
    /// Creates a transient (retryable) failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal (non-retryable) failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Creates a cancellation error from an optional reason.
    #[must_use]
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::Cancelled(reason.unwrap_or_else(|| "cancellation requested".to_string()))
    }

    /// Creates a streaming runtime fault wrapping the given cause.
    #[must_use]
    pub fn streaming_runtime(message: impl Into<String>) -> Self {
        Self::StreamingRuntime {
            message: message.into(),
        }
    }

    /// Returns true if this error is retryable under the default
    /// classification.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns true if this error represents cooperative cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Short kind tag used in event payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandlerNotFound(_) => "handler_not_found",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::StreamingRuntime { .. } => "streaming_runtime",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FlowguardError::transient("timeout").is_transient());
        assert!(!FlowguardError::fatal("bad request").is_transient());
        assert!(!FlowguardError::cancelled(None).is_transient());
    }

    #[test]
    fn test_cancelled_reason_default() {
        let err = FlowguardError::cancelled(None);
        assert!(err.to_string().contains("cancellation requested"));

        let err = FlowguardError::cancelled(Some("shutdown".to_string()));
        assert!(err.to_string().contains("shutdown"));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(FlowguardError::HandlerNotFound("Ping").kind(), "handler_not_found");
        assert_eq!(
            FlowguardError::ResourceExhausted {
                occupancy: 10,
                capacity: 10
            }
            .kind(),
            "resource_exhausted"
        );
        assert_eq!(
            FlowguardError::streaming_runtime("task panicked").kind(),
            "streaming_runtime"
        );
    }
}
