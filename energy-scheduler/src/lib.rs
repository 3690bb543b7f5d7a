//! Retry Scheduler
//!
//! Periodically drives the ledger's retryable backlogs.
//!
//! # Architecture
//!
//! - **Work sources**: accrual (every account) and inbound (deposit events)
//!   behind one [`WorkSource`] trait
//! - **Sweeps**: page through everything due, claim-and-skip, bounded
//!   fan-out, failures and panics isolated per item
//! - **Deposit intake**: [`ChannelFeed`] fed by [`forward_deposits`];
//!   unrecorded deposits are requeued, never dropped
//! - **Loops**: one interval loop per source, first tick immediate, stopped
//!   through a `watch` channel
//!
//! # Example
//!
//! ```no_run
//! use energy_ledger::{AccrualEngine, Config, InboundReconciler, Ledger};
//! use energy_scheduler::{AccrualSource, InboundSource, RetryScheduler, SchedulerConfig, SchedulerMetrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ledger = Arc::new(Ledger::open(Config::default())?);
//!     let metrics = SchedulerMetrics::new(ledger.metrics().registry())?;
//!
//!     let scheduler = RetryScheduler::new(Arc::clone(ledger.locks()), SchedulerConfig::default(), metrics)
//!         .with_source(Arc::new(AccrualSource::new(AccrualEngine::new(Arc::clone(&ledger)))))
//!         .with_source(Arc::new(InboundSource::new(InboundReconciler::new(Arc::clone(&ledger)))));
//!
//!     let reports = scheduler.sweep_all(chrono::Utc::now()).await?;
//!     println!("{:?}", reports);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod sources;

// Re-exports
pub use config::{NodeConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use metrics::SchedulerMetrics;
pub use scheduler::{ItemOutcome, RetryScheduler, SweepReport, WorkSource};
pub use sources::{forward_deposits, AccrualSource, ChannelFeed, DepositFeed, InboundSource};
