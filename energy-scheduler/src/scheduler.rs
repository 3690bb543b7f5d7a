//! Retry scheduler
//!
//! One periodic loop per [`WorkSource`]. Every tick spawns a sweep that
//! pages through all due items `batch_size` keys at a time, claims the ones
//! no other sweep holds and processes them concurrently inside a bounded
//! window. A failing or panicking item
//! gets the failure recorded on its own work state and the sweep moves on.
//!
//! The first tick fires immediately, so a restarted node backfills at once.
//! A sweep that overruns its interval keeps running; the next tick starts a
//! new sweep which skips whatever the previous one still holds.

use crate::{config::SchedulerConfig, metrics::SchedulerMetrics, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_ledger::{FailureOutcome, LockManager};
use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of processing one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Work finished
    Done,
    /// The source recorded a retryable failure itself
    Retrying,
    /// Permanently rejected, never picked up again
    Rejected,
}

impl ItemOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Done => "done",
            ItemOutcome::Retrying => "retrying",
            ItemOutcome::Rejected => "rejected",
        }
    }
}

/// A backlog the scheduler can sweep
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Short name for logs, metrics and claim keys
    fn name(&self) -> &'static str;

    /// Pull new work into the backlog before due items are selected
    async fn prepare(&self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    /// Keys of the items due at `now`, at most `limit`
    ///
    /// Keys come back in a stable order. `after` is the last key of the
    /// previous page; `None` starts from the beginning.
    async fn due_keys(&self, now: DateTime<Utc>, after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    /// Process one item
    ///
    /// An `Err` or a panic makes the scheduler call
    /// [`WorkSource::record_failure`]. Failures the source already wrote to
    /// the item come back as [`ItemOutcome::Retrying`] and are not recorded twice.
    async fn process(&self, key: &str, now: DateTime<Utc>) -> Result<ItemOutcome>;

    /// Record a failed attempt on the item's work state
    async fn record_failure(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome>;
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Items this sweep claimed and processed
    pub claimed: usize,
    /// Items that finished their work
    pub succeeded: usize,
    /// Items that errored, panicked, were rejected or left retrying
    pub failed: usize,
    /// Due items held by another sweep
    pub skipped: usize,
}

enum Finished {
    Processed(ItemOutcome),
    Errored,
    Panicked,
}

impl Finished {
    fn label(&self) -> &'static str {
        match self {
            Finished::Processed(outcome) => outcome.as_str(),
            Finished::Errored => "error",
            Finished::Panicked => "panic",
        }
    }
}

/// Periodic driver for accrual and inbound backlogs
pub struct RetryScheduler {
    locks: Arc<LockManager>,
    config: SchedulerConfig,
    metrics: SchedulerMetrics,
    sources: Vec<Arc<dyn WorkSource>>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("config", &self.config)
            .field("sources", &self.source_names())
            .finish_non_exhaustive()
    }
}

impl RetryScheduler {
    /// Create a scheduler claiming through `locks`
    pub fn new(locks: Arc<LockManager>, config: SchedulerConfig, metrics: SchedulerMetrics) -> Self {
        Self {
            locks,
            config,
            metrics,
            sources: Vec::new(),
        }
    }

    /// Add a work source
    pub fn with_source(mut self, source: Arc<dyn WorkSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Names of the registered sources
    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Sweep every source once, one after the other
    pub async fn sweep_all(&self, now: DateTime<Utc>) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            reports.push(self.sweep_once(source, now).await?);
        }
        Ok(reports)
    }

    /// Run one sweep over `source`
    ///
    /// `Err` only when the first page of due items could not be listed; item
    /// failures are counted in the report.
    pub async fn sweep_once(&self, source: &Arc<dyn WorkSource>, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let name = source.name();

        if let Err(err) = source.prepare(now).await {
            warn!(source = name, error = %err, "Failed to pull new work, sweeping backlog only");
        }

        let page_size = self.config.batch_size.max(1);
        let window = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = SweepReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let keys = match source.due_keys(now, cursor.as_deref(), page_size).await {
                Ok(keys) => keys,
                Err(err) if cursor.is_none() => return Err(err),
                Err(err) => {
                    warn!(source = name, error = %err, "Failed to list next page, finishing sweep early");
                    break;
                }
            };
            let last_page = keys.len() < page_size;
            cursor = keys.last().cloned();

            for key in keys {
                let Some(claim) = self.locks.try_claim(&claim_key(name, &key)) else {
                    debug!(source = name, key = %key, "Item held by another sweep, skipping");
                    report.skipped += 1;
                    continue;
                };
                let Ok(permit) = Arc::clone(&window).acquire_owned().await else {
                    break;
                };

                report.claimed += 1;
                let source = Arc::clone(source);
                tasks.spawn(async move {
                    let _permit = permit;
                    let _claim = claim;
                    run_item(source.as_ref(), &key, now).await
                });
            }

            if last_page || cursor.is_none() {
                break;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(finished) => {
                    if matches!(finished, Finished::Processed(ItemOutcome::Done)) {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                    self.metrics.record_item(name, finished.label());
                }
                Err(err) => {
                    report.failed += 1;
                    self.metrics.record_item(name, "aborted");
                    error!(source = name, error = %err, "Work item task aborted");
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_sweep(name, elapsed);
        if report.claimed > 0 || report.skipped > 0 {
            info!(
                source = name,
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                duration_ms = elapsed.as_millis() as u64,
                "Sweep complete"
            );
        } else {
            debug!(source = name, "Sweep found nothing due");
        }
        Ok(report)
    }

    /// Run every source's loop until `shutdown` flips to `true`
    ///
    /// In-flight sweeps finish their claimed items before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            sources = ?self.source_names(),
            interval_secs = self.config.interval_secs,
            max_concurrency = self.config.max_concurrency,
            "Starting retry scheduler"
        );

        let mut loops = JoinSet::new();
        for source in self.sources.clone() {
            loops.spawn(Arc::clone(&self).run_source(source, shutdown.clone()));
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Sweep loop terminated abnormally");
            }
        }

        info!("Retry scheduler stopped");
    }

    async fn run_source(self: Arc<Self>, source: Arc<dyn WorkSource>, mut shutdown: watch::Receiver<bool>) {
        let name = source.name();
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeps = JoinSet::new();
        let mut first = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                Some(joined) = sweeps.join_next(), if !sweeps.is_empty() => {
                    if let Err(err) = joined {
                        error!(source = name, error = %err, "Sweep task aborted");
                    }
                    continue;
                }
            }

            if !first {
                let delay = self.jitter();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
            first = false;

            let this = Arc::clone(&self);
            let source = Arc::clone(&source);
            sweeps.spawn(async move {
                if let Err(err) = this.sweep_once(&source, Utc::now()).await {
                    warn!(source = source.name(), error = %err, "Sweep failed");
                }
            });
        }

        while let Some(joined) = sweeps.join_next().await {
            if let Err(err) = joined {
                error!(source = name, error = %err, "Sweep task aborted");
            }
        }
        info!(source = name, "Sweep loop stopped");
    }

    fn jitter(&self) -> Duration {
        if self.config.jitter_secs == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.config.jitter_secs.saturating_mul(1000);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

fn claim_key(source: &str, key: &str) -> String {
    format!("{}:{}", source, key)
}

async fn run_item(source: &dyn WorkSource, key: &str, now: DateTime<Utc>) -> Finished {
    let name = source.name();
    let (finished, reason) = match AssertUnwindSafe(source.process(key, now)).catch_unwind().await {
        Ok(Ok(outcome)) => return Finished::Processed(outcome),
        Ok(Err(err)) => {
            warn!(source = name, key, error = %err, "Work item failed");
            (Finished::Errored, err.to_string())
        }
        Err(panic) => {
            let reason = format!("panicked: {}", panic_message(panic.as_ref()));
            error!(source = name, key, error = %reason, "Work item panicked");
            (Finished::Panicked, reason)
        }
    };

    match source.record_failure(key, &reason, now).await {
        Ok(FailureOutcome::Rescheduled(at)) => {
            debug!(source = name, key, next_retry_at = %at, "Work item rescheduled");
        }
        Ok(FailureOutcome::Exhausted) => {
            warn!(source = name, key, "Work item exhausted its retries");
        }
        Err(err) => {
            error!(source = name, key, error = %err, "Failed to record work item failure");
        }
    }
    finished
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        keys: Vec<String>,
        delay: Duration,
        processed: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        pages: AtomicUsize,
        failures: Mutex<Vec<(String, String)>>,
    }

    impl FakeSource {
        fn new(keys: &[&str]) -> Self {
            Self {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                delay: Duration::ZERO,
                processed: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                pages: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkSource for FakeSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn due_keys(&self, _now: DateTime<Utc>, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
            self.pages.fetch_add(1, Ordering::SeqCst);
            let start = match after {
                Some(after) => self.keys.iter().position(|k| k == after).map_or(0, |i| i + 1),
                None => 0,
            };
            Ok(self.keys.iter().skip(start).take(limit).cloned().collect())
        }

        async fn process(&self, key: &str, _now: DateTime<Utc>) -> Result<ItemOutcome> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.processed.fetch_add(1, Ordering::SeqCst);

            if key.starts_with("panic") {
                panic!("boom");
            }
            if key.starts_with("err") {
                return Err(Error::Feed("upstream unavailable".into()));
            }
            if key.starts_with("rejected") {
                return Ok(ItemOutcome::Rejected);
            }
            Ok(ItemOutcome::Done)
        }

        async fn record_failure(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome> {
            self.failures
                .lock()
                .unwrap()
                .push((key.to_string(), reason.to_string()));
            Ok(FailureOutcome::Rescheduled(now + chrono::Duration::seconds(600)))
        }
    }

    fn scheduler(config: SchedulerConfig, source: Arc<FakeSource>) -> (RetryScheduler, Arc<LockManager>) {
        let locks = Arc::new(LockManager::new());
        let metrics = SchedulerMetrics::new(&Registry::new()).unwrap();
        let scheduler = RetryScheduler::new(Arc::clone(&locks), config, metrics).with_source(source);
        (scheduler, locks)
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let source = Arc::new(FakeSource::new(&["ok-1", "err-2", "panic-3", "rejected-4", "ok-5"]));
        let (scheduler, _locks) = scheduler(SchedulerConfig::default(), Arc::clone(&source));

        let reports = scheduler.sweep_all(Utc::now()).await.unwrap();
        assert_eq!(
            reports,
            vec![SweepReport {
                claimed: 5,
                succeeded: 2,
                failed: 3,
                skipped: 0
            }]
        );

        let mut failures = source.failures.lock().unwrap().clone();
        failures.sort();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0, "err-2");
        assert_eq!(failures[1].0, "panic-3");
        assert!(failures[1].1.contains("boom"));
    }

    #[tokio::test]
    async fn test_claimed_items_are_skipped() {
        let source = Arc::new(FakeSource::new(&["a", "b", "c"]));
        let (scheduler, locks) = scheduler(SchedulerConfig::default(), Arc::clone(&source));

        let held = locks.try_claim("fake:b").unwrap();
        let report = scheduler.sweep_all(Utc::now()).await.unwrap()[0];
        assert_eq!(report.claimed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(source.processed.load(Ordering::SeqCst), 2);

        drop(held);
        let report = scheduler.sweep_all(Utc::now()).await.unwrap()[0];
        assert_eq!(report.claimed, 3);
        assert!(!locks.is_claimed("fake:a"));
    }

    #[tokio::test]
    async fn test_concurrency_window_is_bounded() {
        let keys: Vec<String> = (0..12).map(|i| format!("item-{}", i)).collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut fake = FakeSource::new(&keys);
        fake.delay = Duration::from_millis(20);
        let source = Arc::new(fake);

        let config = SchedulerConfig {
            max_concurrency: 3,
            ..SchedulerConfig::default()
        };
        let (scheduler, _locks) = scheduler(config, Arc::clone(&source));

        let report = scheduler.sweep_all(Utc::now()).await.unwrap()[0];
        assert_eq!(report.succeeded, 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
        assert!(source.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_sweep_pages_past_batch_size() {
        let source = Arc::new(FakeSource::new(&["a", "b", "c", "d", "e"]));
        let config = SchedulerConfig {
            batch_size: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, locks) = scheduler(config, Arc::clone(&source));

        let report = scheduler.sweep_all(Utc::now()).await.unwrap()[0];
        assert_eq!(report.claimed, 5);
        assert_eq!(source.processed.load(Ordering::SeqCst), 5);
        assert_eq!(source.pages.load(Ordering::SeqCst), 3);

        let held_a = locks.try_claim("fake:a").unwrap();
        let held_b = locks.try_claim("fake:b").unwrap();
        let report = scheduler.sweep_all(Utc::now()).await.unwrap()[0];
        assert_eq!(report.skipped, 2);
        assert_eq!(report.claimed, 3);
        drop((held_a, held_b));
    }

    #[tokio::test]
    async fn test_first_tick_immediate_and_shutdown() {
        let source = Arc::new(FakeSource::new(&["a"]));
        let config = SchedulerConfig {
            interval_secs: 3600,
            ..SchedulerConfig::default()
        };
        let (scheduler, _locks) = scheduler(config, Arc::clone(&source));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(scheduler).run(rx));

        for _ in 0..200 {
            if source.processed.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.processed.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
