//! Cooperative cancellation.
//!
//! A single [`CancellationToken`] is threaded through the entire behavior
//! chain. In-flight delays (retry backoff, throttle) suspend via
//! [`sleep_cancellable`] so that cancellation stops them immediately.

mod token;

pub use token::{CancelCallback, CancellationToken};

use crate::errors::FlowguardError;
use std::time::Duration;

/// Sleeps for `duration`, aborting immediately if the token is cancelled.
///
/// # Errors
///
/// Returns [`FlowguardError::Cancelled`] if cancellation is observed before
/// the sleep completes.
pub async fn sleep_cancellable(
    duration: Duration,
    ct: &CancellationToken,
) -> Result<(), FlowguardError> {
    if ct.is_cancelled() {
        return Err(FlowguardError::cancelled(ct.reason()));
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = ct.cancelled() => Err(FlowguardError::cancelled(ct.reason())),
    }
}
