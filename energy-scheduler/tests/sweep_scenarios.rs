//! End-to-end sweeps over a real ledger store
//!
//! Each test drives the scheduler with explicit timestamps so retry times can
//! be reached without waiting.

use chrono::{DateTime, Duration, TimeZone, Utc};
use energy_ledger::{
    AccountId, AccrualEngine, Amount, Config, DepositEvent, InboundReconciler, InboundStatus, Ledger,
};
use energy_scheduler::{
    AccrualSource, ChannelFeed, InboundSource, RetryScheduler, SchedulerConfig, SchedulerMetrics, SweepReport,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

const BANK: i64 = 1_000;

struct Harness {
    ledger: Arc<Ledger>,
    reconciler: InboundReconciler,
    deposits: mpsc::Sender<DepositEvent>,
    scheduler: RetryScheduler,
    _temp: TempDir,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn harness(config: SchedulerConfig) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let mut ledger_config = Config::default();
    ledger_config.data_dir = temp_dir.path().to_path_buf();
    ledger_config.bank.initial_balance = Amount::from_units(BANK);
    let ledger = Arc::new(Ledger::open(ledger_config).unwrap());

    let reconciler = InboundReconciler::new(Arc::clone(&ledger));
    let (deposits, feed) = ChannelFeed::new(64, 64);
    let metrics = SchedulerMetrics::new(ledger.metrics().registry()).unwrap();

    let scheduler = RetryScheduler::new(Arc::clone(ledger.locks()), config, metrics)
        .with_source(Arc::new(AccrualSource::new(AccrualEngine::new(Arc::clone(&ledger)))))
        .with_source(Arc::new(InboundSource::new(reconciler.clone()).with_feed(Arc::new(feed))));

    Harness {
        ledger,
        reconciler,
        deposits,
        scheduler,
        _temp: temp_dir,
    }
}

fn deposit(tx_hash: &str, amount: i64, memo: &str) -> DepositEvent {
    DepositEvent {
        tx_hash: tx_hash.to_string(),
        amount: Amount::from_units(amount),
        memo: memo.to_string(),
        observed_at: t0(),
        from_address: Some("EQsender".to_string()),
    }
}

/// Sweep both sources; returns (accrual, inbound)
async fn sweep(h: &Harness, now: DateTime<Utc>) -> (SweepReport, SweepReport) {
    let reports = h.scheduler.sweep_all(now).await.unwrap();
    assert_eq!(reports.len(), 2);
    (reports[0], reports[1])
}

#[tokio::test]
async fn test_transient_failure_then_credited_on_next_sweep() {
    let h = harness(SchedulerConfig::default());
    h.deposits.send(deposit("tx-1", 25, "EFHC42")).await.unwrap();

    // account 42 does not exist yet
    let (_, inbound) = sweep(&h, t0()).await;
    assert_eq!(
        inbound,
        SweepReport {
            claimed: 1,
            succeeded: 0,
            failed: 1,
            skipped: 0
        }
    );

    let event = h.reconciler.get("tx-1").unwrap().unwrap();
    assert_eq!(event.status, InboundStatus::ErrorRetryable);
    assert_eq!(event.schedule.retries_count, 1);
    let retry_at = event.schedule.next_retry_at.unwrap();
    assert!(retry_at > t0());
    assert!(event.schedule.last_error.is_some());

    h.ledger.open_account(AccountId::new(42), t0()).await.unwrap();

    // not due yet
    let (_, inbound) = sweep(&h, t0() + Duration::seconds(1)).await;
    assert_eq!(inbound.claimed, 0);

    let (_, inbound) = sweep(&h, retry_at).await;
    assert_eq!(inbound.succeeded, 1);

    let event = h.reconciler.get("tx-1").unwrap().unwrap();
    assert_eq!(event.status, InboundStatus::Credited);
    assert!(event.credited_ledger_entry_id.is_some());

    let entry = h.ledger.get_entry_by_key("inbound:tx-1").unwrap().unwrap();
    assert_eq!(entry.tx_hash.as_deref(), Some("tx-1"));
    assert_eq!(Some(entry.id), event.credited_ledger_entry_id);
    assert_eq!(
        h.ledger.get_account(AccountId::new(42)).unwrap().main_balance,
        Amount::from_units(25)
    );
    assert_eq!(h.ledger.get_bank().unwrap().balance, Amount::from_units(BANK - 25));
}

#[tokio::test]
async fn test_unrecognized_memo_is_never_retried() {
    let h = harness(SchedulerConfig::default());
    h.deposits.send(deposit("tx-bad", 10, "hello there")).await.unwrap();

    let (_, inbound) = sweep(&h, t0()).await;
    assert_eq!(inbound.claimed, 1);
    assert_eq!(inbound.failed, 1);

    let event = h.reconciler.get("tx-bad").unwrap().unwrap();
    assert_eq!(event.status, InboundStatus::ErrorValidation);
    assert_eq!(event.schedule.retries_count, 0);
    assert!(event.schedule.last_error.is_some());

    let (_, inbound) = sweep(&h, t0() + Duration::days(30)).await;
    assert_eq!(inbound.claimed, 0);
    assert_eq!(h.ledger.storage().get_stats().unwrap().ledger_entries, 0);
    assert_eq!(h.ledger.get_bank().unwrap().balance, Amount::from_units(BANK));
}

#[tokio::test]
async fn test_redelivered_deposit_credits_once() {
    let h = harness(SchedulerConfig::default());
    h.ledger.open_account(AccountId::new(7), t0()).await.unwrap();

    h.deposits.send(deposit("tx-dup", 5, "EFHC7")).await.unwrap();
    h.deposits.send(deposit("tx-dup", 5, "EFHC7")).await.unwrap();
    let (_, inbound) = sweep(&h, t0()).await;
    assert_eq!(inbound.claimed, 1);
    assert_eq!(inbound.succeeded, 1);

    h.deposits.send(deposit("tx-dup", 5, "EFHC7")).await.unwrap();
    let (_, inbound) = sweep(&h, t0() + Duration::seconds(5)).await;
    assert_eq!(inbound.claimed, 0);

    assert_eq!(h.ledger.storage().get_stats().unwrap().ledger_entries, 1);
    assert_eq!(
        h.ledger.get_account(AccountId::new(7)).unwrap().main_balance,
        Amount::from_units(5)
    );
}

#[tokio::test]
async fn test_package_memo_credits_quantity() {
    let h = harness(SchedulerConfig::default());
    h.ledger.open_account(AccountId::new(3), t0()).await.unwrap();

    h.deposits
        .send(deposit("tx-pkg", 1, "SKU:EFHC|Q:100|TG:3"))
        .await
        .unwrap();
    let (_, inbound) = sweep(&h, t0()).await;
    assert_eq!(inbound.succeeded, 1);
    assert_eq!(
        h.ledger.get_account(AccountId::new(3)).unwrap().main_balance,
        Amount::from_units(100)
    );
}

#[tokio::test]
async fn test_accrual_sweep_backfills_every_account() {
    let h = harness(SchedulerConfig::default());
    for id in 1..=3 {
        h.ledger.open_account(AccountId::new(id), t0()).await.unwrap();
    }
    h.ledger.set_vip(AccountId::new(3), true, t0()).await.unwrap();

    let (accrual, _) = sweep(&h, t0()).await;
    assert_eq!(accrual.claimed, 3);

    let (accrual, _) = sweep(&h, t0() + Duration::hours(1)).await;
    assert_eq!(accrual.succeeded, 3);
    assert_eq!(accrual.failed, 0);

    let energy = |id: u64| h.ledger.get_account(AccountId::new(id)).unwrap().available_energy.to_string();
    assert_eq!(energy(1), "0.02491200");
    assert_eq!(energy(2), "0.02491200");
    assert_eq!(energy(3), "0.02667600");

    // a second sweep at the same instant credits nothing
    sweep(&h, t0() + Duration::hours(1)).await;
    assert_eq!(energy(1), "0.02491200");
}

#[tokio::test]
async fn test_sweep_reaches_backlog_larger_than_batch() {
    let config = SchedulerConfig {
        batch_size: 2,
        ..SchedulerConfig::default()
    };
    let h = harness(config);
    for id in 1..=5 {
        h.ledger.open_account(AccountId::new(id), t0()).await.unwrap();
    }
    for id in 1..=3 {
        h.deposits
            .send(deposit(&format!("tx-{}", id), 10, &format!("EFHC{}", id)))
            .await
            .unwrap();
    }

    let (accrual, inbound) = sweep(&h, t0()).await;
    assert_eq!(accrual.claimed, 5);
    assert_eq!(inbound.claimed, 3);
    assert_eq!(inbound.succeeded, 3);

    let (accrual, _) = sweep(&h, t0() + Duration::hours(1)).await;
    assert_eq!(accrual.succeeded, 5);
    for id in 1..=5 {
        let account = h.ledger.get_account(AccountId::new(id)).unwrap();
        assert_eq!(account.available_energy.to_string(), "0.02491200");
    }
    for id in 1..=3 {
        let account = h.ledger.get_account(AccountId::new(id)).unwrap();
        assert_eq!(account.main_balance, Amount::from_units(10));
    }
}

#[tokio::test]
async fn test_running_scheduler_credits_and_stops() {
    let config = SchedulerConfig {
        interval_secs: 3600,
        jitter_secs: 0,
        ..SchedulerConfig::default()
    };
    let h = harness(config);
    h.ledger.open_account(AccountId::new(9), Utc::now()).await.unwrap();
    h.deposits.send(deposit("tx-live", 2, "EFHC9")).await.unwrap();

    let Harness {
        ledger,
        reconciler,
        scheduler,
        _temp,
        ..
    } = h;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::new(scheduler).run(shutdown_rx));

    let mut credited = false;
    for _ in 0..300 {
        if let Some(event) = reconciler.get("tx-live").unwrap() {
            if event.status == InboundStatus::Credited {
                credited = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(credited);
    assert_eq!(
        ledger.get_account(AccountId::new(9)).unwrap().main_balance,
        Amount::from_units(2)
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
}
