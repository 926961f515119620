//! Time-scoped rolling sample window for circuit statistics.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling success/failure samples pruned to a sampling duration.
///
/// Callers hold the breaker's lock while touching the window, so the window
/// itself needs no synchronization.
#[derive(Debug)]
pub(crate) struct SampleWindow {
    samples: VecDeque<(Instant, bool)>,
    duration: Duration,
}

impl SampleWindow {
    pub(crate) fn new(duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            duration,
        }
    }

    /// Records one completion outcome at `now`.
    pub(crate) fn record(&mut self, success: bool, now: Instant) {
        self.prune(now);
        self.samples.push_back((now, success));
    }

    /// Drops samples older than the sampling duration.
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) >= self.duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn failure_percentage(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        (failures as f64 / self.samples.len() as f64) * 100.0
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }
}
