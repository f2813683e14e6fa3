use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Run-wide counters. Cloning shares the same underlying snapshot, so every
/// job thread records into one place.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_step(&self, step_name: &str) -> StepTimer {
        StepTimer {
            step: step_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_job(&self, succeeded: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if succeeded {
                guard.jobs_succeeded += 1;
            } else {
                guard.jobs_failed += 1;
            }
        }
    }

    pub fn record_cache(&self, hit: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if hit {
                guard.cache_hits += 1;
            } else {
                guard.cache_misses += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StepTimer {
    step: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StepTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.step.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            step = self.step.as_str(),
            duration_ms,
            failed = self.failed,
            "Step duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        jobs_succeeded = snapshot.jobs_succeeded,
        jobs_failed = snapshot.jobs_failed,
        cache_hits = snapshot.cache_hits,
        cache_misses = snapshot.cache_misses,
        "Release metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("slsk_release_jobs_succeeded_total", "Jobs that published their artifact", self.jobs_succeeded),
            ("slsk_release_jobs_failed_total", "Jobs that ended in the failed state", self.jobs_failed),
            ("slsk_release_cache_hits_total", "Dependency cache hits", self.cache_hits),
            ("slsk_release_cache_misses_total", "Dependency cache misses", self.cache_misses),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        out.push_str("# HELP slsk_release_step_calls_total Step invocation count\n");
        out.push_str("# TYPE slsk_release_step_calls_total counter\n");
        out.push_str("# HELP slsk_release_step_failures_total Step failure count\n");
        out.push_str("# TYPE slsk_release_step_failures_total counter\n");
        out.push_str(
            "# HELP slsk_release_step_duration_seconds_total Accumulated step duration in seconds\n",
        );
        out.push_str("# TYPE slsk_release_step_duration_seconds_total counter\n");
        out.push_str("# HELP slsk_release_step_duration_seconds_max Maximum step duration in seconds\n");
        out.push_str("# TYPE slsk_release_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            let _ = writeln!(
                out,
                "slsk_release_step_calls_total{{step=\"{step}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                out,
                "slsk_release_step_failures_total{{step=\"{step}\"}} {}",
                metrics.failures
            );
            let _ = writeln!(
                out,
                "slsk_release_step_duration_seconds_total{{step=\"{step}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                out,
                "slsk_release_step_duration_seconds_max{{step=\"{step}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }

        out.push_str("# HELP slsk_release_run_duration_seconds Total run duration\n");
        out.push_str("# TYPE slsk_release_run_duration_seconds gauge\n");
        let _ = writeln!(
            out,
            "slsk_release_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        out
    }
}
