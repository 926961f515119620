//! Backpressure-aware stream flow control.
//!
//! A controller regulates one stream invocation's in-flight buffer against
//! a slow consumer. Pressure engages when occupancy crosses the high
//! watermark (or a custom trigger fires) and disengages only below the low
//! watermark, giving hysteresis; while engaged, the configured strategy
//! mitigates: buffer to a hard cap, drop, throttle the producer, or sample.

mod controller;

pub use controller::BackpressureBehavior;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mitigation strategy applied while pressure is engaged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpressureStrategy {
    /// Accept items up to the hard capacity; beyond it, fail the stream
    /// with resource exhaustion.
    Buffer,
    /// Accept items, evicting to stay within capacity. With `prefer_newer`
    /// the oldest buffered item is evicted; otherwise the incoming item is
    /// rejected.
    Drop {
        /// Keep the most recent items rather than the oldest.
        prefer_newer: bool,
    },
    /// Accept items but delay the producer's next production, scaling
    /// linearly with occupancy between the two watermarks.
    Throttle {
        /// Delay applied at (and beyond) the high watermark.
        max_delay: Duration,
    },
    /// Accept only every Nth item; the rest are discarded without
    /// buffering.
    Sample {
        /// Keep one item out of every `rate`.
        rate: u32,
    },
}

/// Occupancy snapshot passed to custom triggers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackpressureSnapshot {
    /// Items currently buffered.
    pub occupancy: usize,
    /// Configured buffer capacity.
    pub capacity: usize,
    /// Whether pressure is currently engaged.
    pub engaged: bool,
}

/// Pressure state changes and mitigating actions, delivered to the
/// configured pressure handler.
#[derive(Debug, Clone)]
pub enum PressureEvent {
    /// Pressure engaged (high watermark crossed or custom trigger fired).
    Engaged(BackpressureSnapshot),
    /// Pressure disengaged (occupancy fell below the low watermark).
    Disengaged(BackpressureSnapshot),
    /// An item was evicted or rejected by the Drop strategy.
    ItemDropped {
        /// Occupancy at the time of the drop.
        occupancy: usize,
    },
    /// An item was discarded by the Sample strategy.
    ItemSampledOut,
    /// The producer was delayed by the Throttle strategy.
    ProducerThrottled {
        /// The applied delay.
        delay: Duration,
    },
    /// The Buffer strategy hit hard capacity.
    Overflow {
        /// Occupancy at overflow.
        occupancy: usize,
        /// Configured capacity.
        capacity: usize,
    },
}

/// Custom pressure trigger evaluated in addition to the watermark rule.
pub type PressureTrigger = Arc<dyn Fn(&BackpressureSnapshot) -> bool + Send + Sync>;

/// Side-effecting hook observing pressure state changes and mitigations.
pub type PressureHandler = Arc<dyn Fn(&PressureEvent) + Send + Sync>;

/// Configuration for one stream's backpressure controller.
#[derive(Clone)]
pub struct BackpressureConfig {
    /// Hard buffer capacity.
    pub max_buffer_size: usize,
    /// Engage fraction of `max_buffer_size`.
    pub high_watermark: f64,
    /// Disengage fraction of `max_buffer_size`.
    pub low_watermark: f64,
    /// Mitigation strategy while engaged.
    pub strategy: BackpressureStrategy,
    trigger: Option<PressureTrigger>,
    handler: Option<PressureHandler>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024,
            high_watermark: 0.8,
            low_watermark: 0.5,
            strategy: BackpressureStrategy::Buffer,
            trigger: None,
            handler: None,
        }
    }
}

impl BackpressureConfig {
    /// Creates a config with defaults: capacity 1024, watermarks 0.8/0.5,
    /// Buffer strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hard buffer capacity.
    #[must_use]
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size.max(1);
        self
    }

    /// Sets the high (engage) watermark as a fraction of capacity.
    #[must_use]
    pub fn with_high_watermark(mut self, fraction: f64) -> Self {
        self.high_watermark = fraction;
        self
    }

    /// Sets the low (disengage) watermark as a fraction of capacity.
    #[must_use]
    pub fn with_low_watermark(mut self, fraction: f64) -> Self {
        self.low_watermark = fraction;
        self
    }

    /// Sets the mitigation strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Adds a custom trigger, evaluated in addition to the watermark rule.
    /// Returning true forces engagement even below the high watermark.
    #[must_use]
    pub fn with_trigger<F>(mut self, trigger: F) -> Self
    where
        F: Fn(&BackpressureSnapshot) -> bool + Send + Sync + 'static,
    {
        self.trigger = Some(Arc::new(trigger));
        self
    }

    /// Adds a pressure handler hook.
    #[must_use]
    pub fn with_pressure_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PressureEvent) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn trigger_fires(&self, snapshot: &BackpressureSnapshot) -> bool {
        self.trigger.as_ref().is_some_and(|t| t(snapshot))
    }

    pub(crate) fn notify_handler(&self, event: &PressureEvent) {
        if let Some(handler) = &self.handler {
            handler(event);
        }
    }

    pub(crate) fn high_threshold(&self) -> f64 {
        self.high_watermark * self.max_buffer_size as f64
    }

    pub(crate) fn low_threshold(&self) -> f64 {
        self.low_watermark * self.max_buffer_size as f64
    }

    /// Throttle delay for the given occupancy: 0 at the low watermark,
    /// `max_delay` at the high watermark, linear in between.
    pub(crate) fn throttle_delay(&self, occupancy: usize, max_delay: Duration) -> Duration {
        let low = self.low_threshold();
        let high = self.high_threshold();
        if high <= low {
            return max_delay;
        }
        let fraction = ((occupancy as f64 - low) / (high - low)).clamp(0.0, 1.0);
        max_delay.mul_f64(fraction)
    }
}

impl std::fmt::Debug for BackpressureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureConfig")
            .field("max_buffer_size", &self.max_buffer_size)
            .field("high_watermark", &self.high_watermark)
            .field("low_watermark", &self.low_watermark)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Aggregate backpressure counters.
#[derive(Debug, Default)]
pub struct BackpressureMetrics {
    produced: AtomicU64,
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    peak_occupancy: AtomicUsize,
}

impl BackpressureMetrics {
    pub(crate) fn record_produced(&self, occupancy: usize) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        self.peak_occupancy.fetch_max(occupancy, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sampled_out(&self) {
        self.sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Items offered by producers.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Items evicted or rejected by the Drop strategy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items discarded by the Sample strategy.
    #[must_use]
    pub fn sampled_out(&self) -> u64 {
        self.sampled_out.load(Ordering::Relaxed)
    }

    /// Highest observed occupancy.
    #[must_use]
    pub fn peak_occupancy(&self) -> usize {
        self.peak_occupancy.load(Ordering::Relaxed)
    }

    /// Drop rate as a percentage of produced items.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let produced = self.produced();
        if produced == 0 {
            0.0
        } else {
            (self.dropped() as f64 / produced as f64) * 100.0
        }
    }

    /// JSON snapshot for event payloads.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "produced": self.produced(),
            "dropped": self.dropped(),
            "sampled_out": self.sampled_out(),
            "peak_occupancy": self.peak_occupancy(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults() {
        let config = BackpressureConfig::default();
        assert_eq!(config.max_buffer_size, 1024);
        assert!((config.high_watermark - 0.8).abs() < f64::EPSILON);
        assert!((config.low_watermark - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_throttle_delay_scales_between_watermarks() {
        let config = BackpressureConfig::new()
            .with_max_buffer_size(100)
            .with_high_watermark(0.8)
            .with_low_watermark(0.4);
        let max_delay = Duration::from_millis(100);

        // At or below the low watermark: no delay.
        assert_eq!(config.throttle_delay(40, max_delay), Duration::ZERO);
        assert_eq!(config.throttle_delay(10, max_delay), Duration::ZERO);
        // Midway: half the delay.
        assert_eq!(
            config.throttle_delay(60, max_delay),
            Duration::from_millis(50)
        );
        // At or above the high watermark: the full delay.
        assert_eq!(config.throttle_delay(80, max_delay), max_delay);
        assert_eq!(config.throttle_delay(95, max_delay), max_delay);
    }

    #[test]
    fn test_metrics_counting() {
        let metrics = BackpressureMetrics::default();
        metrics.record_produced(3);
        metrics.record_produced(7);
        metrics.record_dropped();

        assert_eq!(metrics.produced(), 2);
        assert_eq!(metrics.dropped(), 1);
        assert_eq!(metrics.peak_occupancy(), 7);
        assert!((metrics.drop_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metrics_snapshot_shape() {
        let metrics = BackpressureMetrics::default();
        metrics.record_produced(1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["produced"], 1);
        assert_eq!(snapshot["dropped"], 0);
    }
}
