//! Work sources over the ledger's two backlogs
//!
//! - [`AccrualSource`]: every account is a work item; a sweep backfills energy
//!   up to the sweep time
//! - [`InboundSource`]: deposit events not yet credited or rejected; an
//!   optional [`DepositFeed`] is drained first so new deposits are handled in
//!   the same sweep as the backlog. Deposits that could not be recorded go
//!   back to the feed and come out first on the next poll.

use crate::scheduler::{ItemOutcome, WorkSource};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_ledger::{AccountId, AccrualEngine, DepositEvent, FailureOutcome, InboundReconciler, InboundStatus};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Mutex};

/// Accrual backlog
#[derive(Debug, Clone)]
pub struct AccrualSource {
    engine: AccrualEngine,
}

impl AccrualSource {
    /// Source driving `engine`
    pub fn new(engine: AccrualEngine) -> Self {
        Self { engine }
    }
}

fn parse_account(key: &str) -> Result<AccountId> {
    key.parse::<u64>()
        .map(AccountId::new)
        .map_err(|_| Error::InvalidKey(key.to_string()))
}

#[async_trait]
impl WorkSource for AccrualSource {
    fn name(&self) -> &'static str {
        "accrual"
    }

    async fn due_keys(&self, now: DateTime<Utc>, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let after = after.map(parse_account).transpose()?;
        Ok(self
            .engine
            .due_accounts(now, after, limit)?
            .into_iter()
            .map(|account| account.id.to_string())
            .collect())
    }

    async fn process(&self, key: &str, now: DateTime<Utc>) -> Result<ItemOutcome> {
        let id = parse_account(key)?;
        self.engine.accrue_for(id, now).await?;
        Ok(ItemOutcome::Done)
    }

    async fn record_failure(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome> {
        let id = parse_account(key)?;
        Ok(self.engine.record_failure(id, reason, now).await?)
    }
}

/// Source of freshly observed deposits
#[async_trait]
pub trait DepositFeed: Send + Sync {
    /// Deposits seen since the previous poll
    async fn poll(&self) -> Result<Vec<DepositEvent>>;

    /// Hand back deposits that were polled but not recorded
    ///
    /// They are returned, in order, ahead of anything new on the next poll.
    async fn requeue(&self, deposits: Vec<DepositEvent>) -> Result<()>;
}

#[derive(Debug)]
struct FeedState {
    rx: mpsc::Receiver<DepositEvent>,
    retained: VecDeque<DepositEvent>,
}

/// In-process feed backed by a bounded channel
#[derive(Debug)]
pub struct ChannelFeed {
    state: Mutex<FeedState>,
    max_batch: usize,
}

impl ChannelFeed {
    /// Create a feed and the sender the chain client pushes into
    pub fn new(capacity: usize, max_batch: usize) -> (mpsc::Sender<DepositEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                state: Mutex::new(FeedState {
                    rx,
                    retained: VecDeque::new(),
                }),
                max_batch: max_batch.max(1),
            },
        )
    }
}

#[async_trait]
impl DepositFeed for ChannelFeed {
    async fn poll(&self) -> Result<Vec<DepositEvent>> {
        let mut state = self.state.lock().await;
        let take = state.retained.len().min(self.max_batch);
        let mut deposits: Vec<DepositEvent> = state.retained.drain(..take).collect();
        while deposits.len() < self.max_batch {
            match state.rx.try_recv() {
                Ok(deposit) => deposits.push(deposit),
                Err(_) => break,
            }
        }
        Ok(deposits)
    }

    async fn requeue(&self, deposits: Vec<DepositEvent>) -> Result<()> {
        let mut state = self.state.lock().await;
        for deposit in deposits.into_iter().rev() {
            state.retained.push_front(deposit);
        }
        Ok(())
    }
}

/// Forward newline-delimited JSON deposits from `reader` into a feed sender
///
/// Blank lines are ignored and malformed lines are logged and skipped.
/// Returns the number forwarded once the reader is exhausted or the feed is gone.
pub async fn forward_deposits<R>(reader: R, tx: mpsc::Sender<DepositEvent>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let deposit: DepositEvent = match serde_json::from_str(line) {
            Ok(deposit) => deposit,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed deposit line");
                continue;
            }
        };
        if tx.send(deposit).await.is_err() {
            tracing::warn!("Deposit feed closed, stopping intake");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Record polled deposits in order through `observe`
///
/// Stops at the first failure and requeues that deposit and everything after
/// it, so nothing taken off the feed is dropped.
async fn record_deposits<F, Fut>(feed: &dyn DepositFeed, deposits: Vec<DepositEvent>, mut observe: F) -> Result<usize>
where
    F: FnMut(DepositEvent) -> Fut,
    Fut: Future<Output = energy_ledger::Result<()>>,
{
    let mut recorded = 0usize;
    let mut pending = deposits.into_iter();
    while let Some(deposit) = pending.next() {
        if let Err(err) = observe(deposit.clone()).await {
            tracing::warn!(tx_hash = %deposit.tx_hash, error = %err, "Failed to record deposit, requeueing");
            let mut unrecorded = vec![deposit];
            unrecorded.extend(pending);
            feed.requeue(unrecorded).await?;
            return Err(err.into());
        }
        recorded += 1;
    }
    Ok(recorded)
}

/// Inbound backlog
#[derive(Clone)]
pub struct InboundSource {
    reconciler: InboundReconciler,
    feed: Option<Arc<dyn DepositFeed>>,
}

impl std::fmt::Debug for InboundSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundSource")
            .field("reconciler", &self.reconciler)
            .field("has_feed", &self.feed.is_some())
            .finish()
    }
}

impl InboundSource {
    /// Source sweeping only the stored backlog
    pub fn new(reconciler: InboundReconciler) -> Self {
        Self { reconciler, feed: None }
    }

    /// Also drain `feed` at the start of every sweep
    pub fn with_feed(mut self, feed: Arc<dyn DepositFeed>) -> Self {
        self.feed = Some(feed);
        self
    }
}

#[async_trait]
impl WorkSource for InboundSource {
    fn name(&self) -> &'static str {
        "inbound"
    }

    async fn prepare(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(feed) = &self.feed else {
            return Ok(());
        };

        let deposits = feed.poll().await?;
        let reconciler = &self.reconciler;
        let recorded = record_deposits(feed.as_ref(), deposits, |deposit| async move {
            reconciler.observe(deposit, now).await.map(|_| ())
        })
        .await?;
        if recorded > 0 {
            tracing::debug!(recorded, "Deposits pulled from feed");
        }
        Ok(())
    }

    async fn due_keys(&self, now: DateTime<Utc>, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .reconciler
            .due_events(now, after, limit)?
            .into_iter()
            .map(|event| event.tx_hash)
            .collect())
    }

    async fn process(&self, key: &str, now: DateTime<Utc>) -> Result<ItemOutcome> {
        let event = self.reconciler.advance(key, now).await?;
        Ok(match event.status {
            InboundStatus::Credited => ItemOutcome::Done,
            InboundStatus::ErrorValidation => ItemOutcome::Rejected,
            InboundStatus::Received | InboundStatus::Parsed | InboundStatus::ErrorRetryable => {
                ItemOutcome::Retrying
            }
        })
    }

    async fn record_failure(&self, key: &str, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome> {
        Ok(self.reconciler.record_failure(key, reason, now).await?)
    }
}
