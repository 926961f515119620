//! The per-stream monitor and its behavior wrapper.

use super::{
    HealthReport, HealthReporter, HealthStatus, HealthThresholds, HealthWarning,
    LoggingHealthReporter, MemorySampler, ProcMemorySampler, WarningKind,
};
use crate::cancellation::{sleep_cancellable, CancellationToken};
use crate::decouple::{decouple, StreamHooks};
use crate::dispatch::{StreamBehavior, StreamNext};
use crate::errors::FlowguardError;
use crate::request::{ItemStream, StreamRequest};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

struct MonitorState {
    items: u64,
    errors: u64,
    peak_throughput: f64,
    last_item_at: Instant,
    status: HealthStatus,
    warnings: Vec<HealthWarning>,
    last_error: Option<String>,
}

/// Tracks one stream's vital signs against thresholds.
///
/// Status is monotonic: once degraded, it never recovers within the
/// stream's lifetime. Each warning kind is surfaced at most once, and the
/// critical report fires at most once, the first time the status reaches
/// `Unhealthy` or worse.
pub struct StreamHealthMonitor {
    stream_id: Uuid,
    thresholds: HealthThresholds,
    sampler: Arc<dyn MemorySampler>,
    reporter: Arc<dyn HealthReporter>,
    started_at: Instant,
    baseline_memory: u64,
    state: Mutex<MonitorState>,
    critical_sent: AtomicBool,
}

impl StreamHealthMonitor {
    /// Creates a monitor, sampling baseline memory immediately.
    #[must_use]
    pub fn new(
        thresholds: HealthThresholds,
        sampler: Arc<dyn MemorySampler>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        let baseline_memory = sampler.resident_bytes();
        Self {
            stream_id: Uuid::new_v4(),
            thresholds,
            sampler,
            reporter,
            started_at: Instant::now(),
            baseline_memory,
            state: Mutex::new(MonitorState {
                items: 0,
                errors: 0,
                peak_throughput: 0.0,
                last_item_at: Instant::now(),
                status: HealthStatus::Healthy,
                warnings: Vec::new(),
                last_error: None,
            }),
            critical_sent: AtomicBool::new(false),
        }
    }

    /// Identifier assigned to this stream invocation, carried on every
    /// report it generates.
    #[must_use]
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Records one produced item.
    pub fn record_item(&self) {
        let mut st = self.state.lock();
        st.items += 1;
        st.last_item_at = Instant::now();
    }

    /// Records one recoverable error.
    pub fn record_error(&self) {
        self.state.lock().errors += 1;
    }

    /// Records the stream's terminal failure. Escalates to `Failed` and
    /// delivers the critical report if it has not fired yet. Reporting
    /// runs on a spawned task so this stays callable from sync hooks.
    pub fn record_failure(&self, err: &FlowguardError) {
        let report = {
            let mut st = self.state.lock();
            st.errors += 1;
            st.status = HealthStatus::Failed;
            st.last_error = Some(err.to_string());
            self.take_critical(&st)
        };
        if let Some(report) = report {
            let reporter = Arc::clone(&self.reporter);
            tokio::spawn(async move {
                reporter.report_critical(&report).await;
            });
        }
    }

    /// Evaluates every tracked condition, surfaces new warnings, and
    /// returns the (possibly escalated) status.
    pub async fn check(&self) -> HealthStatus {
        let now = Instant::now();
        let elapsed = now.duration_since(self.started_at);
        let memory_now = self.sampler.resident_bytes();
        let memory_growth = memory_now.saturating_sub(self.baseline_memory);

        let (status, new_warnings, critical) = {
            let mut st = self.state.lock();
            let mut triggered: Vec<(WarningKind, HealthStatus, String, serde_json::Value)> =
                Vec::new();

            let gap = now.duration_since(st.last_item_at);
            if gap > self.thresholds.stall_timeout {
                triggered.push((
                    WarningKind::Stall,
                    HealthStatus::Unhealthy,
                    format!("no items for {}ms", gap.as_millis()),
                    serde_json::json!({
                        "gap_ms": gap.as_millis() as u64,
                        "stall_timeout_ms": self.thresholds.stall_timeout.as_millis() as u64,
                    }),
                ));
            }

            // Throughput is meaningless before the first interval elapses.
            let throughput = if elapsed.as_secs_f64() > 0.0 {
                st.items as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            };
            st.peak_throughput = st.peak_throughput.max(throughput);
            if elapsed >= self.thresholds.check_interval
                && throughput < self.thresholds.min_throughput
            {
                triggered.push((
                    WarningKind::LowThroughput,
                    HealthStatus::Warning,
                    format!(
                        "throughput {throughput:.3} items/sec below minimum {:.3}",
                        self.thresholds.min_throughput
                    ),
                    serde_json::json!({
                        "throughput": throughput,
                        "min_throughput": self.thresholds.min_throughput,
                    }),
                ));
            }

            if memory_growth > self.thresholds.max_memory_growth {
                triggered.push((
                    WarningKind::MemoryGrowth,
                    HealthStatus::Warning,
                    format!("resident memory grew by {memory_growth} bytes"),
                    serde_json::json!({
                        "growth_bytes": memory_growth,
                        "max_growth_bytes": self.thresholds.max_memory_growth,
                    }),
                ));
            }

            let total = st.items + st.errors;
            if total > 0 {
                let error_rate = st.errors as f64 / total as f64;
                if error_rate > self.thresholds.max_error_rate {
                    triggered.push((
                        WarningKind::HighErrorRate,
                        HealthStatus::Unhealthy,
                        format!("error rate {error_rate:.2} exceeds maximum"),
                        serde_json::json!({
                            "error_rate": error_rate,
                            "max_error_rate": self.thresholds.max_error_rate,
                            "errors": st.errors,
                            "items": st.items,
                        }),
                    ));
                }
            }

            let mut new_warnings = Vec::new();
            for (kind, severity, message, details) in triggered {
                st.status = st.status.max(severity);
                if !st.warnings.iter().any(|w| w.kind == kind) {
                    let warning = HealthWarning {
                        kind,
                        message,
                        details,
                        at: Utc::now(),
                    };
                    st.warnings.push(warning.clone());
                    new_warnings.push(warning);
                }
            }
            let critical = self.take_critical(&st);
            (st.status, new_warnings, critical)
        };

        for warning in &new_warnings {
            self.reporter.report_warning(warning).await;
        }
        if let Some(report) = critical {
            self.reporter.report_critical(&report).await;
        }
        status
    }

    /// Current verdict without re-evaluating conditions.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    /// Point-in-time summary of everything tracked so far.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let st = self.state.lock();
        self.build_report(&st)
    }

    fn build_report(&self, st: &MonitorState) -> HealthReport {
        let elapsed = self.started_at.elapsed();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            st.items as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        HealthReport {
            stream_id: self.stream_id,
            status: st.status,
            items_produced: st.items,
            errors: st.errors,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput,
            peak_throughput: st.peak_throughput.max(throughput),
            memory_growth_bytes: self
                .sampler
                .resident_bytes()
                .saturating_sub(self.baseline_memory),
            last_error: st.last_error.clone(),
            warnings: st.warnings.clone(),
            generated_at: Utc::now(),
        }
    }

    fn take_critical(&self, st: &MonitorState) -> Option<HealthReport> {
        if st.status >= HealthStatus::Unhealthy && !self.critical_sent.swap(true, Ordering::SeqCst)
        {
            Some(self.build_report(st))
        } else {
            None
        }
    }
}

/// Attaches a health monitor to each streaming invocation.
///
/// Items are observed through the decoupling runtime's hooks; a periodic
/// task runs threshold checks until the stream completes.
pub struct HealthMonitorBehavior {
    thresholds: HealthThresholds,
    sampler: Arc<dyn MemorySampler>,
    reporter: Arc<dyn HealthReporter>,
}

impl HealthMonitorBehavior {
    /// Creates a behavior with the given thresholds, sampling procfs and
    /// reporting through the tracing framework.
    #[must_use]
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            sampler: Arc::new(ProcMemorySampler),
            reporter: Arc::new(LoggingHealthReporter),
        }
    }

    /// Replaces the reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replaces the memory sampler.
    #[must_use]
    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }
}

impl<R: StreamRequest> StreamBehavior<R> for HealthMonitorBehavior {
    fn handle(
        &self,
        request: Arc<R>,
        next: StreamNext<R>,
        ct: CancellationToken,
    ) -> ItemStream<R::Item> {
        let monitor = Arc::new(StreamHealthMonitor::new(
            self.thresholds.clone(),
            Arc::clone(&self.sampler),
            Arc::clone(&self.reporter),
        ));
        let inner = next.run(request, ct.clone());

        // The ticker outlives nothing: its own token is cancelled from the
        // completion hook.
        let ticker_ct = CancellationToken::new();
        {
            let monitor = Arc::clone(&monitor);
            let ticker_ct = ticker_ct.clone();
            let interval = self.thresholds.check_interval;
            tokio::spawn(async move {
                while sleep_cancellable(interval, &ticker_ct).await.is_ok() {
                    monitor.check().await;
                }
            });
        }

        let hooks = StreamHooks::new()
            .with_on_item({
                let monitor = Arc::clone(&monitor);
                move |_item: &R::Item| monitor.record_item()
            })
            .with_on_complete({
                let monitor = Arc::clone(&monitor);
                move |outcome: Option<&FlowguardError>| {
                    if let Some(err) = outcome {
                        if !err.is_cancelled() {
                            monitor.record_failure(err);
                        }
                    }
                    ticker_ct.cancel("stream completed");
                }
            });
        decouple(inner, None, ct, hooks)
    }
}
