//! Retryable work items
//!
//! Accrual backlog (accounts) and inbound backlog (deposit events) share one
//! shape: a status, a retry counter and the time the next attempt is due.
//! The scheduler only ever talks to that shape through [`WorkItem`], so the
//! sweep and failure bookkeeping are written once.
//!
//! Time is a trigger, not a filter: an item is due as soon as
//! `next_retry_at <= now`, however old it is.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retry bookkeeping embedded in every work item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    /// Failed attempts so far
    pub retries_count: u32,
    /// Earliest time of the next attempt (None = due immediately)
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Diagnostic from the last failure
    pub last_error: Option<String>,
}

impl RetrySchedule {
    /// Forget previous failures
    pub fn reset(&mut self) {
        *self = RetrySchedule::default();
    }
}

/// Capability shared by every kind of retryable work
pub trait WorkItem {
    /// Identity used for claims and logs
    fn work_key(&self) -> String;

    /// Retry bookkeeping
    fn schedule(&self) -> &RetrySchedule;

    /// Mutable retry bookkeeping
    fn schedule_mut(&mut self) -> &mut RetrySchedule;

    /// No further processing will ever happen
    fn is_terminal(&self) -> bool;

    /// Move into the item's retryable error status
    fn mark_retryable(&mut self, reason: &str);

    /// Move into the item's permanent failure status once retries run out
    fn mark_exhausted(&mut self, reason: &str);

    /// Non-terminal and its retry time has arrived
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal()
            && self
                .schedule()
                .next_retry_at
                .map_or(true, |at| at <= now)
    }
}

/// Back-off shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Always `base_delay_secs`
    Fixed,
    /// `base_delay_secs * 2^(retries - 1)`, capped at `max_delay_secs`
    Exponential,
}

/// Retry policy for failed work items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First delay (seconds)
    pub base_delay_secs: u64,
    /// Delay ceiling (seconds)
    pub max_delay_secs: u64,
    /// Failed attempts allowed before an item is declared exhausted
    pub max_retries: u32,
    /// Back-off shape
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 600, // one scheduler tick
            max_delay_secs: 3600,
            max_retries: 12,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following the `retries_count`-th failure
    pub fn delay_for(&self, retries_count: u32) -> Duration {
        let secs = match self.backoff {
            Backoff::Fixed => self.base_delay_secs,
            Backoff::Exponential => {
                let exp = retries_count.saturating_sub(1).min(32);
                self.base_delay_secs.saturating_mul(2_u64.saturating_pow(exp))
            }
        };
        Duration::seconds(secs.min(self.max_delay_secs.max(self.base_delay_secs)) as i64)
    }
}

/// What happened to an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be retried at the given time
    Rescheduled(DateTime<Utc>),
    /// Retry ceiling reached
    Exhausted,
}

/// Record a failed attempt on any work item
///
/// Increments `retries_count`, stores the diagnostic and either schedules the
/// next attempt or, past the ceiling, marks the item exhausted. Items that
/// cannot become terminal keep retrying at the policy's delay.
pub fn record_failure<W: WorkItem + ?Sized>(
    item: &mut W,
    reason: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> FailureOutcome {
    let schedule = item.schedule_mut();
    schedule.retries_count = schedule.retries_count.saturating_add(1);
    schedule.last_error = Some(reason.to_string());
    let retries = schedule.retries_count;

    if retries >= policy.max_retries {
        item.mark_exhausted(reason);
        if item.is_terminal() {
            item.schedule_mut().next_retry_at = None;
            return FailureOutcome::Exhausted;
        }
    } else {
        item.mark_retryable(reason);
    }

    let at = now + policy.delay_for(retries);
    item.schedule_mut().next_retry_at = Some(at);
    FailureOutcome::Rescheduled(at)
}

/// One page of due items, in the order `items` yields them, at most `limit`
///
/// Storage hands in an iterator that starts after the previous page's last
/// key, so repeated calls walk the whole backlog whatever the retry times.
pub fn select_due<W, E>(
    items: impl IntoIterator<Item = std::result::Result<W, E>>,
    now: DateTime<Utc>,
    limit: usize,
) -> std::result::Result<Vec<W>, E>
where
    W: WorkItem,
{
    let mut due = Vec::new();
    for item in items {
        if due.len() >= limit {
            break;
        }
        let item = item?;
        if item.is_due(now) {
            due.push(item);
        }
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Job {
        key: &'static str,
        done: bool,
        failed: bool,
        schedule: RetrySchedule,
    }

    impl Job {
        fn new(key: &'static str) -> Self {
            Self { key, done: false, failed: false, schedule: RetrySchedule::default() }
        }
    }

    impl WorkItem for Job {
        fn work_key(&self) -> String {
            self.key.to_string()
        }
        fn schedule(&self) -> &RetrySchedule {
            &self.schedule
        }
        fn schedule_mut(&mut self) -> &mut RetrySchedule {
            &mut self.schedule
        }
        fn is_terminal(&self) -> bool {
            self.done || self.failed
        }
        fn mark_retryable(&mut self, _reason: &str) {}
        fn mark_exhausted(&mut self, _reason: &str) {
            self.failed = true;
        }
    }

    #[test]
    fn test_old_backlog_is_due() {
        let now = Utc::now();
        let mut job = Job::new("a");
        job.schedule.next_retry_at = Some(now - Duration::days(3));
        assert!(job.is_due(now));

        job.schedule.next_retry_at = Some(now + Duration::seconds(1));
        assert!(!job.is_due(now));

        job.schedule.next_retry_at = None;
        job.done = true;
        assert!(!job.is_due(now));
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(600));
        assert_eq!(policy.delay_for(2), Duration::seconds(1200));
        assert_eq!(policy.delay_for(3), Duration::seconds(2400));
        assert_eq!(policy.delay_for(10), Duration::seconds(3600));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy { backoff: Backoff::Fixed, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for(1), Duration::seconds(600));
        assert_eq!(policy.delay_for(7), Duration::seconds(600));
    }

    #[test]
    fn test_record_failure_then_exhaust() {
        let now = Utc::now();
        let policy = RetryPolicy { max_retries: 2, ..RetryPolicy::default() };
        let mut job = Job::new("a");

        let first = record_failure(&mut job, "timeout", &policy, now);
        assert_eq!(first, FailureOutcome::Rescheduled(now + Duration::seconds(600)));
        assert_eq!(job.schedule.retries_count, 1);
        assert!(!job.is_terminal());

        let second = record_failure(&mut job, "timeout", &policy, now);
        assert_eq!(second, FailureOutcome::Exhausted);
        assert!(job.is_terminal());
        assert_eq!(job.schedule.next_retry_at, None);
        assert_eq!(job.schedule.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_select_due_keeps_order_and_limits() {
        let now = Utc::now();
        let mut a = Job::new("a");
        a.schedule.next_retry_at = Some(now - Duration::minutes(5));
        let mut b = Job::new("b");
        b.schedule.next_retry_at = Some(now - Duration::days(2));
        let mut c = Job::new("c");
        c.schedule.next_retry_at = Some(now + Duration::minutes(5));
        let d = Job::new("d");

        let jobs = vec![a, b, c, d];
        let page = select_due(jobs.iter().cloned().map(Ok::<_, ()>), now, 2).unwrap();
        let keys: Vec<_> = page.iter().map(|j| j.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let rest = select_due(jobs.into_iter().skip(2).map(Ok::<_, ()>), now, 2).unwrap();
        let keys: Vec<_> = rest.iter().map(|j| j.key).collect();
        assert_eq!(keys, vec!["d"]);
    }

    #[test]
    fn test_select_due_stops_on_error() {
        let now = Utc::now();
        let items = vec![Ok(Job::new("a")), Err("corrupt row"), Ok(Job::new("b"))];
        assert_eq!(select_due(items, now, 10).unwrap_err(), "corrupt row");
    }
}
