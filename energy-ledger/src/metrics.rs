//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_transfers_total` - Committed ledger rows
//! - `ledger_transfer_replays_total` - Transfers answered from an existing row
//! - `ledger_transfer_rejections_total` - Transfers rejected before commit, by error code
//! - `ledger_deficit_transfers_total` - Rows committed with the bank in deficit
//! - `ledger_bank_balance` - Bank balance after the last commit
//! - `ledger_commit_duration_seconds` - Histogram of commit latencies
//! - `ledger_request_replays_total` - Client requests answered by the idempotency guard
//! - `ledger_accrued_energy_total` - Energy credited by accrual
//! - `ledger_inbound_transitions_total` - Inbound state transitions, by target status

use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed ledger rows
    pub transfers_total: IntCounter,

    /// Replayed transfers
    pub transfer_replays_total: IntCounter,

    /// Rejected transfers by error code
    pub transfer_rejections_total: IntCounterVec,

    /// Rows committed while the bank was in deficit
    pub deficit_transfers_total: IntCounter,

    /// Bank balance
    pub bank_balance: Gauge,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Guard replays
    pub request_replays_total: IntCounter,

    /// Energy accrued
    pub accrued_energy_total: Counter,

    /// Inbound transitions by status
    pub inbound_transitions_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_total =
            IntCounter::new("ledger_transfers_total", "Committed ledger rows")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transfer_replays_total = IntCounter::new(
            "ledger_transfer_replays_total",
            "Transfers answered from an existing ledger row",
        )?;
        registry.register(Box::new(transfer_replays_total.clone()))?;

        let transfer_rejections_total = IntCounterVec::new(
            Opts::new(
                "ledger_transfer_rejections_total",
                "Transfers rejected before commit",
            ),
            &["code"],
        )?;
        registry.register(Box::new(transfer_rejections_total.clone()))?;

        let deficit_transfers_total = IntCounter::new(
            "ledger_deficit_transfers_total",
            "Rows committed with the bank in deficit",
        )?;
        registry.register(Box::new(deficit_transfers_total.clone()))?;

        let bank_balance = Gauge::new("ledger_bank_balance", "Bank balance after the last commit")?;
        registry.register(Box::new(bank_balance.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_duration_seconds",
                "Histogram of commit latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        let request_replays_total = IntCounter::new(
            "ledger_request_replays_total",
            "Client requests answered by the idempotency guard",
        )?;
        registry.register(Box::new(request_replays_total.clone()))?;

        let accrued_energy_total =
            Counter::new("ledger_accrued_energy_total", "Energy credited by accrual")?;
        registry.register(Box::new(accrued_energy_total.clone()))?;

        let inbound_transitions_total = IntCounterVec::new(
            Opts::new(
                "ledger_inbound_transitions_total",
                "Inbound state transitions",
            ),
            &["status"],
        )?;
        registry.register(Box::new(inbound_transitions_total.clone()))?;

        Ok(Self {
            transfers_total,
            transfer_replays_total,
            transfer_rejections_total,
            deficit_transfers_total,
            bank_balance,
            commit_duration,
            request_replays_total,
            accrued_energy_total,
            inbound_transitions_total,
            registry,
        })
    }

    /// Record a committed row
    pub fn record_commit(
        &self,
        processed_with_deficit: bool,
        bank_balance: Option<f64>,
        duration_seconds: f64,
    ) {
        self.transfers_total.inc();
        if processed_with_deficit {
            self.deficit_transfers_total.inc();
        }
        if let Some(balance) = bank_balance {
            self.bank_balance.set(balance);
        }
        self.commit_duration.observe(duration_seconds);
    }

    /// Record a replayed transfer
    pub fn record_replay(&self) {
        self.transfer_replays_total.inc();
    }

    /// Record a rejected transfer
    pub fn record_rejection(&self, code: &str) {
        self.transfer_rejections_total.with_label_values(&[code]).inc();
    }

    /// Record a guard replay
    pub fn record_request_replay(&self) {
        self.request_replays_total.inc();
    }

    /// Record accrued energy
    pub fn record_accrual(&self, energy: f64) {
        if energy > 0.0 {
            self.accrued_energy_total.inc_by(energy);
        }
    }

    /// Record an inbound transition
    pub fn record_inbound(&self, status: &str) {
        self.inbound_transitions_total.with_label_values(&[status]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("transfers_total", &self.transfers_total.get())
            .field("transfer_replays_total", &self.transfer_replays_total.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.transfers_total.get(), 0);
        assert_eq!(metrics.deficit_transfers_total.get(), 0);
    }

    #[test]
    fn test_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_replay();
        assert_eq!(a.transfer_replays_total.get(), 1);
        assert_eq!(b.transfer_replays_total.get(), 0);
    }

    #[test]
    fn test_record_commit() {
        let metrics = Metrics::new().unwrap();
        metrics.record_commit(false, Some(80.0), 0.001);
        metrics.record_commit(true, Some(-20.0), 0.002);
        metrics.record_commit(false, None, 0.002);
        assert_eq!(metrics.transfers_total.get(), 3);
        assert_eq!(metrics.deficit_transfers_total.get(), 1);
        assert_eq!(metrics.bank_balance.get(), -20.0);
    }

    #[test]
    fn test_labelled_counters_render() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection("insufficient_balance");
        metrics.record_inbound("credited");
        assert_eq!(
            metrics
                .transfer_rejections_total
                .with_label_values(&["insufficient_balance"])
                .get(),
            1
        );
        let text = metrics.render();
        assert!(text.contains("ledger_inbound_transitions_total"));
    }
}
