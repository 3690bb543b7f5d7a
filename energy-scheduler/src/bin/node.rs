//! Energy node binary: opens the ledger and runs the retry scheduler
//!
//! Deposits enter through stdin as newline-delimited JSON `DepositEvent`s,
//! so a chain watcher can be piped straight into the node.

use anyhow::Context;
use energy_ledger::{AccrualEngine, InboundReconciler, Ledger};
use energy_scheduler::{
    forward_deposits, AccrualSource, ChannelFeed, InboundSource, NodeConfig, RetryScheduler, SchedulerMetrics,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEPOSIT_QUEUE_CAPACITY: usize = 1024;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("ENERGY_NODE_CONFIG") {
        Ok(path) => NodeConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => NodeConfig::from_env().context("reading environment")?,
    };

    init_tracing(config.log_json);
    tracing::info!(
        service = %config.ledger.service_name,
        version = %config.ledger.service_version,
        data_dir = %config.ledger.data_dir.display(),
        "Starting energy node"
    );

    // Open ledger
    let ledger = Arc::new(Ledger::open(config.ledger.clone()).context("opening ledger")?);
    let stats = ledger.storage().get_stats()?;
    tracing::info!(
        ledger_entries = stats.ledger_entries,
        accounts = stats.accounts,
        pending_inbound = stats.pending_inbound,
        "Ledger opened"
    );

    let metrics = SchedulerMetrics::new(ledger.metrics().registry())?;
    let mut scheduler = RetryScheduler::new(Arc::clone(ledger.locks()), config.scheduler.clone(), metrics);
    if config.scheduler.accrual_enabled {
        let engine = AccrualEngine::new(Arc::clone(&ledger));
        scheduler = scheduler.with_source(Arc::new(AccrualSource::new(engine)));
    }
    if config.scheduler.inbound_enabled {
        let (deposits, feed) = ChannelFeed::new(DEPOSIT_QUEUE_CAPACITY, config.scheduler.batch_size);
        let reconciler = InboundReconciler::new(Arc::clone(&ledger));
        scheduler = scheduler.with_source(Arc::new(InboundSource::new(reconciler).with_feed(Arc::new(feed))));

        tokio::spawn(async move {
            match forward_deposits(BufReader::new(tokio::io::stdin()), deposits).await {
                Ok(forwarded) => tracing::info!(forwarded, "Deposit intake closed"),
                Err(err) => tracing::error!(error = %err, "Deposit intake failed"),
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::new(scheduler).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, waiting for in-flight sweeps");

    let _ = shutdown_tx.send(true);
    running.await.context("scheduler task")?;

    tracing::info!("Energy node stopped");
    Ok(())
}
