//! Scheduler metrics
//!
//! Registered into the ledger's registry so one scrape covers the process.
//!
//! - `scheduler_sweeps_total{source}`
//! - `scheduler_items_total{source, outcome}`
//! - `scheduler_sweep_duration_seconds{source}`

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Sweep counters and timings
#[derive(Clone)]
pub struct SchedulerMetrics {
    /// Completed sweeps per source
    pub sweeps_total: IntCounterVec,

    /// Processed items per source and outcome
    pub items_total: IntCounterVec,

    /// Sweep duration per source
    pub sweep_duration: HistogramVec,
}

impl SchedulerMetrics {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let sweeps_total = IntCounterVec::new(
            Opts::new("scheduler_sweeps_total", "Completed sweeps"),
            &["source"],
        )?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let items_total = IntCounterVec::new(
            Opts::new("scheduler_items_total", "Work items processed by outcome"),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(items_total.clone()))?;

        let sweep_duration = HistogramVec::new(
            HistogramOpts::new("scheduler_sweep_duration_seconds", "Sweep duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["source"],
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        Ok(Self {
            sweeps_total,
            items_total,
            sweep_duration,
        })
    }

    /// Record a finished sweep
    pub fn record_sweep(&self, source: &str, duration: Duration) {
        self.sweeps_total.with_label_values(&[source]).inc();
        self.sweep_duration
            .with_label_values(&[source])
            .observe(duration.as_secs_f64());
    }

    /// Record one item's outcome
    pub fn record_item(&self, source: &str, outcome: &str) {
        self.items_total.with_label_values(&[source, outcome]).inc();
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics").finish_non_exhaustive()
    }
}
