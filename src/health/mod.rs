//! Stream health monitoring.
//!
//! A monitor rides along a streaming invocation, tracking throughput,
//! stalls, memory growth, and error rate against configured thresholds.
//! Health only degrades over a stream's lifetime; a transient stall that
//! resolves does not restore a `Healthy` verdict. Warnings are surfaced
//! once per condition kind, and a critical report is delivered at most
//! once per stream.

mod monitor;

pub use monitor::{HealthMonitorBehavior, StreamHealthMonitor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Overall stream health verdict. Ordering is by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All tracked conditions are within thresholds.
    Healthy,
    /// A soft condition fired (throughput or memory growth).
    Warning,
    /// A hard condition fired (stall or error rate).
    Unhealthy,
    /// The stream terminated with a failure.
    Failed,
}

/// The condition a warning reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Item rate fell below the configured minimum.
    LowThroughput,
    /// No item was produced within the stall timeout.
    Stall,
    /// Resident memory grew past the configured limit.
    MemoryGrowth,
    /// The error fraction exceeded the configured maximum.
    HighErrorRate,
}

/// One surfaced health condition.
#[derive(Debug, Clone, Serialize)]
pub struct HealthWarning {
    /// Which condition fired.
    pub kind: WarningKind,
    /// Human-readable description.
    pub message: String,
    /// Structured measurements behind the condition.
    pub details: serde_json::Value,
    /// When the condition was observed.
    pub at: DateTime<Utc>,
}

/// Thresholds for the tracked health conditions.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum acceptable item rate, in items per second.
    pub min_throughput: f64,
    /// Maximum acceptable resident memory growth since the stream started,
    /// in bytes.
    pub max_memory_growth: u64,
    /// Longest acceptable gap between items.
    pub stall_timeout: Duration,
    /// Maximum acceptable error fraction, 0.0 to 1.0.
    pub max_error_rate: f64,
    /// Interval between periodic checks. Throughput is not evaluated
    /// before one interval has elapsed.
    pub check_interval: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_throughput: 0.1,
            max_memory_growth: 100 * 1024 * 1024,
            stall_timeout: Duration::from_secs(30),
            max_error_rate: 0.5,
            check_interval: Duration::from_secs(5),
        }
    }
}

impl HealthThresholds {
    /// Creates thresholds with defaults: 0.1 items/sec, 100 MiB growth,
    /// 30s stall timeout, 50% error rate, 5s check interval.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum item rate in items per second.
    #[must_use]
    pub fn with_min_throughput(mut self, items_per_sec: f64) -> Self {
        self.min_throughput = items_per_sec;
        self
    }

    /// Sets the maximum resident memory growth in bytes.
    #[must_use]
    pub fn with_max_memory_growth(mut self, bytes: u64) -> Self {
        self.max_memory_growth = bytes;
        self
    }

    /// Sets the stall timeout.
    #[must_use]
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets the maximum error fraction, 0.0 to 1.0.
    #[must_use]
    pub fn with_max_error_rate(mut self, fraction: f64) -> Self {
        self.max_error_rate = fraction;
        self
    }

    /// Sets the periodic check interval.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

/// A point-in-time health summary, delivered with critical reports and
/// available on demand from the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// The monitored stream invocation this report describes.
    pub stream_id: Uuid,
    /// The verdict at generation time.
    pub status: HealthStatus,
    /// Items produced so far.
    pub items_produced: u64,
    /// Errors recorded so far.
    pub errors: u64,
    /// Milliseconds since the stream started.
    pub elapsed_ms: u64,
    /// Observed item rate in items per second.
    pub throughput: f64,
    /// The highest item rate observed across evaluations.
    pub peak_throughput: f64,
    /// Resident memory growth since the stream started, in bytes.
    pub memory_growth_bytes: u64,
    /// The terminal failure, when the stream has failed.
    pub last_error: Option<String>,
    /// Every warning surfaced so far.
    pub warnings: Vec<HealthWarning>,
    /// When this report was generated.
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// JSON form for event payloads.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Destination for surfaced warnings and critical reports.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Delivers a newly surfaced warning.
    async fn report_warning(&self, warning: &HealthWarning);

    /// Delivers the one critical report for a stream that degraded to
    /// `Unhealthy` or `Failed`.
    async fn report_critical(&self, report: &HealthReport);
}

/// A reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHealthReporter;

#[async_trait]
impl HealthReporter for NoOpHealthReporter {
    async fn report_warning(&self, _warning: &HealthWarning) {}

    async fn report_critical(&self, _report: &HealthReport) {}
}

/// A reporter that logs through the tracing framework. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHealthReporter;

#[async_trait]
impl HealthReporter for LoggingHealthReporter {
    async fn report_warning(&self, warning: &HealthWarning) {
        tracing::warn!(
            kind = ?warning.kind,
            details = %warning.details,
            "stream health warning: {}",
            warning.message
        );
    }

    async fn report_critical(&self, report: &HealthReport) {
        tracing::error!(
            status = ?report.status,
            items = report.items_produced,
            errors = report.errors,
            "stream health critical: {}",
            report.to_json()
        );
    }
}

/// A reporter that retains everything it receives. Intended for tests and
/// in-process inspection.
#[derive(Debug, Default)]
pub struct CollectingHealthReporter {
    warnings: RwLock<Vec<HealthWarning>>,
    criticals: RwLock<Vec<HealthReport>>,
}

impl CollectingHealthReporter {
    /// Creates an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Warnings received so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<HealthWarning> {
        self.warnings.read().clone()
    }

    /// Critical reports received so far.
    #[must_use]
    pub fn criticals(&self) -> Vec<HealthReport> {
        self.criticals.read().clone()
    }
}

#[async_trait]
impl HealthReporter for CollectingHealthReporter {
    async fn report_warning(&self, warning: &HealthWarning) {
        self.warnings.write().push(warning.clone());
    }

    async fn report_critical(&self, report: &HealthReport) {
        self.criticals.write().push(report.clone());
    }
}

/// Source of resident memory readings for growth tracking.
pub trait MemorySampler: Send + Sync {
    /// Current resident set size in bytes, or 0 when unavailable.
    fn resident_bytes(&self) -> u64;
}

/// Samples resident memory from `/proc/self/statm`. Reads 0 on platforms
/// without procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map_or(0, |pages| pages * 4096)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> u64 {
        0
    }
}

/// Allows closures and fixed values to stand in as samplers.
impl<F> MemorySampler for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn resident_bytes(&self) -> u64 {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_orders_by_severity() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Warning < HealthStatus::Unhealthy);
        assert!(HealthStatus::Unhealthy < HealthStatus::Failed);
        assert_eq!(
            HealthStatus::Unhealthy.max(HealthStatus::Warning),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = HealthReport {
            stream_id: Uuid::new_v4(),
            status: HealthStatus::Warning,
            items_produced: 42,
            errors: 1,
            elapsed_ms: 1500,
            throughput: 28.0,
            peak_throughput: 31.5,
            memory_growth_bytes: 0,
            last_error: None,
            warnings: vec![HealthWarning {
                kind: WarningKind::LowThroughput,
                message: "slow".to_string(),
                details: serde_json::json!({"throughput": 28.0}),
                at: Utc::now(),
            }],
            generated_at: Utc::now(),
        };
        let json = report.to_json();
        assert!(json["stream_id"].is_string());
        assert_eq!(json["status"], "warning");
        assert_eq!(json["items_produced"], 42);
        assert_eq!(json["warnings"][0]["kind"], "low_throughput");
    }

    #[tokio::test]
    async fn test_collecting_reporter_retains_in_order() {
        let reporter = CollectingHealthReporter::new();
        reporter
            .report_warning(&HealthWarning {
                kind: WarningKind::Stall,
                message: "stalled".to_string(),
                details: serde_json::Value::Null,
                at: Utc::now(),
            })
            .await;
        assert_eq!(reporter.warnings().len(), 1);
        assert_eq!(reporter.warnings()[0].kind, WarningKind::Stall);
        assert!(reporter.criticals().is_empty());
    }

    #[test]
    fn test_closure_memory_sampler() {
        let sampler = || 4096_u64;
        assert_eq!(MemorySampler::resident_bytes(&sampler), 4096);
    }

    #[test]
    fn test_proc_sampler_does_not_panic() {
        let _ = ProcMemorySampler.resident_bytes();
    }
}
