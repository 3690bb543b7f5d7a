//! Per-second energy accrual with catch-up backfill
//!
//! Energy accrues continuously at a per-second rate. Each run credits
//! `whole seconds since last_accrual_at * rate`, truncated to 8 digits, and
//! moves the checkpoint to `now`. A run that finds no checkpoint (or one in
//! the future) credits nothing and only resets the checkpoint to `now`.
//! Running twice at the same `now` therefore credits zero the second time.

use crate::{
    amount::Amount,
    locks::LockKey,
    ledger::Ledger,
    types::{Account, AccountId, AccrualStatus},
    work::{self, FailureOutcome, RetrySchedule},
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Energy per second for regular accounts (0.00000692)
pub const BASE_RATE: Decimal = Decimal::from_parts(692, 0, 0, false, 8);

/// Energy per second for VIP accounts (0.00000741)
pub const VIP_RATE: Decimal = Decimal::from_parts(741, 0, 0, false, 8);

const SECONDS_PER_DAY: i64 = 86_400;

/// Per-second rate for an account
pub fn rate_for(is_vip: bool) -> Decimal {
    if is_vip {
        VIP_RATE
    } else {
        BASE_RATE
    }
}

/// Daily figure shown to users; never an input to accrual
pub fn daily_display_rate(is_vip: bool) -> Amount {
    Amount::new(rate_for(is_vip) * Decimal::from(SECONDS_PER_DAY))
}

/// Energy earned between `last` and `now`
///
/// Absent or future checkpoints earn nothing.
pub fn compute_delta(last: Option<DateTime<Utc>>, now: DateTime<Utc>, is_vip: bool) -> Result<Amount> {
    let Some(last) = last else {
        return Ok(Amount::ZERO);
    };
    let elapsed = (now - last).num_seconds();
    if elapsed <= 0 {
        return Ok(Amount::ZERO);
    }
    Amount::new(Decimal::from(elapsed)).checked_mul(rate_for(is_vip))
}

/// Checkpoint after accruing up to `now`
///
/// Only whole seconds earn energy, so the sub-second remainder stays ahead of
/// the checkpoint for the next run. Absent or future checkpoints restart at `now`.
pub fn next_checkpoint(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if last <= now => last + Duration::seconds((now - last).num_seconds()),
        _ => now,
    }
}

/// Applies accrual to accounts under their exclusive sections
#[derive(Debug, Clone)]
pub struct AccrualEngine {
    ledger: Arc<Ledger>,
}

impl AccrualEngine {
    /// Create an engine over the ledger's store and locks
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Accrue energy for one account up to `now`; returns the amount credited
    ///
    /// A successful run also clears any previous accrual failure.
    pub async fn accrue_for(&self, id: AccountId, now: DateTime<Utc>) -> Result<Amount> {
        let _guard = self.ledger.locks().acquire([LockKey::Account(id)]).await;

        let storage = self.ledger.storage();
        let mut account = storage
            .get_account(id)?
            .ok_or_else(|| Error::UnknownParty(format!("user:{}", id)))?;

        let delta = compute_delta(account.last_accrual_at, now, account.is_vip)?;
        let checkpoint = next_checkpoint(account.last_accrual_at, now);
        let advance = account.last_accrual_at != Some(checkpoint);

        if delta.is_zero() && !advance && account.accrual_status == AccrualStatus::Pending {
            return Ok(Amount::ZERO);
        }

        account.available_energy = account.available_energy.checked_add(delta)?;
        account.total_generated_energy = account.total_generated_energy.checked_add(delta)?;
        if advance {
            account.last_accrual_at = Some(checkpoint);
        }
        account.accrual_status = AccrualStatus::Pending;
        account.accrual_schedule = RetrySchedule::default();
        account.updated_at = now;
        storage.put_account(&account)?;

        self.ledger.metrics().record_accrual(delta.to_f64());
        tracing::debug!(
            account = %id,
            amount = %delta,
            is_vip = account.is_vip,
            "Energy accrued"
        );
        Ok(delta)
    }

    /// Record a failed accrual attempt on the account's work state
    pub async fn record_failure(
        &self,
        id: AccountId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let _guard = self.ledger.locks().acquire([LockKey::Account(id)]).await;

        let storage = self.ledger.storage();
        let mut account = storage
            .get_account(id)?
            .ok_or_else(|| Error::UnknownParty(format!("user:{}", id)))?;

        let outcome = work::record_failure(&mut account, reason, &self.ledger.config().retry, now);
        account.updated_at = now;
        storage.put_account(&account)?;

        tracing::warn!(
            account = %id,
            retries_count = account.accrual_schedule.retries_count,
            next_retry_at = ?account.accrual_schedule.next_retry_at,
            error = %reason,
            "Accrual failed"
        );
        Ok(outcome)
    }

    /// Accounts whose accrual is due, in id order after `after`
    pub fn due_accounts(
        &self,
        now: DateTime<Utc>,
        after: Option<AccountId>,
        limit: usize,
    ) -> Result<Vec<Account>> {
        self.ledger.storage().due_accounts(now, after, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn create_engine() -> (AccrualEngine, Arc<Ledger>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let ledger = Arc::new(Ledger::open(config).unwrap());
        (AccrualEngine::new(Arc::clone(&ledger)), ledger, temp_dir)
    }

    #[test]
    fn test_rate_constants() {
        assert_eq!(BASE_RATE, Decimal::from_str("0.00000692").unwrap());
        assert_eq!(VIP_RATE, Decimal::from_str("0.00000741").unwrap());
        assert_eq!(daily_display_rate(false).to_string(), "0.59788800");
        assert_eq!(daily_display_rate(true).to_string(), "0.64022400");
    }

    #[test]
    fn test_compute_delta() {
        let now = Utc::now();
        assert_eq!(compute_delta(None, now, false).unwrap(), Amount::ZERO);
        assert_eq!(compute_delta(Some(now + Duration::seconds(5)), now, false).unwrap(), Amount::ZERO);
        assert_eq!(
            compute_delta(Some(now - Duration::seconds(100)), now, false).unwrap().to_string(),
            "0.00069200"
        );
        assert_eq!(
            compute_delta(Some(now - Duration::hours(1)), now, true).unwrap().to_string(),
            "0.02667600"
        );
    }

    #[tokio::test]
    async fn test_first_run_only_initializes() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let now = Utc::now();
        ledger.open_account(id, now).await.unwrap();

        assert_eq!(engine.accrue_for(id, now).await.unwrap(), Amount::ZERO);
        let account = ledger.get_account(id).unwrap();
        assert_eq!(account.last_accrual_at, Some(now));
        assert_eq!(account.available_energy, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_backfill_and_same_timestamp_noop() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let start = Utc::now() - Duration::days(3);
        ledger.open_account(id, start).await.unwrap();
        engine.accrue_for(id, start).await.unwrap();

        let now = start + Duration::days(3);
        let credited = engine.accrue_for(id, now).await.unwrap();
        assert_eq!(credited.to_string(), "1.79366400");

        assert_eq!(engine.accrue_for(id, now).await.unwrap(), Amount::ZERO);
        let account = ledger.get_account(id).unwrap();
        assert_eq!(account.available_energy, credited);
        assert_eq!(account.total_generated_energy, credited);
    }

    #[tokio::test]
    async fn test_vip_read_at_accrual_time() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let start = Utc::now();
        ledger.open_account(id, start).await.unwrap();
        engine.accrue_for(id, start).await.unwrap();
        ledger.set_vip(id, true, start).await.unwrap();

        let credited = engine.accrue_for(id, start + Duration::seconds(1000)).await.unwrap();
        assert_eq!(credited.to_string(), "0.00741000");
    }

    #[tokio::test]
    async fn test_failure_recorded_then_cleared() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let now = Utc::now();
        ledger.open_account(id, now).await.unwrap();

        let outcome = engine.record_failure(id, "store timeout", now).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Rescheduled(at) if at > now));

        let account = ledger.get_account(id).unwrap();
        assert_eq!(account.accrual_status, AccrualStatus::ErrorRetryable);
        assert_eq!(account.accrual_schedule.retries_count, 1);
        assert!(engine.due_accounts(now, None, 10).unwrap().is_empty());

        let later = now + Duration::hours(2);
        assert_eq!(engine.due_accounts(later, None, 10).unwrap().len(), 1);
        engine.accrue_for(id, later).await.unwrap();

        let account = ledger.get_account(id).unwrap();
        assert_eq!(account.accrual_status, AccrualStatus::Pending);
        assert_eq!(account.accrual_schedule.retries_count, 0);
    }

    #[tokio::test]
    async fn test_future_checkpoint_resets_without_credit() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let now = Utc::now();
        ledger.open_account(id, now).await.unwrap();
        engine.accrue_for(id, now + Duration::hours(1)).await.unwrap();

        assert_eq!(engine.accrue_for(id, now).await.unwrap(), Amount::ZERO);
        assert_eq!(ledger.get_account(id).unwrap().last_accrual_at, Some(now));
    }

    #[tokio::test]
    async fn test_sub_second_remainder_carries_over() {
        let (engine, ledger, _temp) = create_engine();
        let id = AccountId::new(1);
        let start = Utc::now();
        ledger.open_account(id, start).await.unwrap();
        engine.accrue_for(id, start).await.unwrap();

        let mut now = start;
        let mut credited = Amount::ZERO;
        for _ in 0..4 {
            now = now + Duration::milliseconds(1500);
            credited = credited.checked_add(engine.accrue_for(id, now).await.unwrap()).unwrap();
        }

        assert_eq!(credited, compute_delta(Some(start), now, false).unwrap());
        assert_eq!(credited.to_string(), "0.00004152");
        assert_eq!(ledger.get_account(id).unwrap().last_accrual_at, Some(start + Duration::seconds(6)));
    }

    #[tokio::test]
    async fn test_paging_due_accounts() {
        let (engine, ledger, _temp) = create_engine();
        let now = Utc::now();
        for raw in 1..=5 {
            ledger.open_account(AccountId::new(raw), now).await.unwrap();
        }
        engine.record_failure(AccountId::new(2), "store timeout", now).await.unwrap();

        let first = engine.due_accounts(now, None, 2).unwrap();
        let ids: Vec<u64> = first.iter().map(|a| a.id.get()).collect();
        assert_eq!(ids, vec![1, 3]);

        let rest = engine.due_accounts(now, Some(AccountId::new(3)), 10).unwrap();
        let ids: Vec<u64> = rest.iter().map(|a| a.id.get()).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (engine, _ledger, _temp) = create_engine();
        let err = engine.accrue_for(AccountId::new(404), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownParty(_)));
    }
}
