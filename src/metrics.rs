use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome counters shared by every worker slot of a pool.
///
/// Every mutation is a single atomic operation; no invariant spans two
/// counters, so readers may observe slight skew between fields.
#[derive(Debug, Default)]
pub(crate) struct PoolMetrics {
  admitted: AtomicU64,
  rejected: AtomicU64,
  succeeded: AtomicU64,
  failed: AtomicU64,
  timed_out: AtomicU64,
  panicked: AtomicU64,
  cancelled: AtomicU64,
  exec_time_micros: AtomicU64,
}

impl PoolMetrics {
  pub(crate) fn record_admitted(&self) {
    self.admitted.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_rejected(&self) {
    self.rejected.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_success(&self) {
    self.succeeded.fetch_add(1, Ordering::Relaxed);
  }

  /// Counts a failed task. Timeouts, panics and cancellations are failures too
  /// and additionally bump their own counter through the dedicated methods.
  pub(crate) fn record_failure(&self) {
    self.failed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_timeout(&self) {
    self.timed_out.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_panic(&self) {
    self.panicked.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_cancelled(&self) {
    self.cancelled.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_exec_time(&self, elapsed: Duration) {
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    self.exec_time_micros.fetch_add(micros, Ordering::Relaxed);
  }

  pub(crate) fn reset(&self) {
    for counter in [
      &self.admitted,
      &self.rejected,
      &self.succeeded,
      &self.failed,
      &self.timed_out,
      &self.panicked,
      &self.cancelled,
      &self.exec_time_micros,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
  }

  pub(crate) fn snapshot(&self, gauges: PoolGauges) -> PoolStats {
    PoolStats {
      admitted: self.admitted.load(Ordering::Relaxed),
      rejected: self.rejected.load(Ordering::Relaxed),
      succeeded: self.succeeded.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      timed_out: self.timed_out.load(Ordering::Relaxed),
      panicked: self.panicked.load(Ordering::Relaxed),
      cancelled: self.cancelled.load(Ordering::Relaxed),
      total_exec_time: Duration::from_micros(self.exec_time_micros.load(Ordering::Relaxed)),
      pool_size: gauges.pool_size,
      queue_size: gauges.queue_size,
      queue_capacity: gauges.queue_capacity,
      active_tasks: gauges.active_tasks,
    }
  }
}

/// Point-in-time values read from the pool rather than from counters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolGauges {
  pub(crate) pool_size: usize,
  pub(crate) queue_size: usize,
  pub(crate) queue_capacity: usize,
  pub(crate) active_tasks: usize,
}

/// Snapshot of a pool's metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
  pub admitted: u64,
  pub rejected: u64,
  pub succeeded: u64,
  pub failed: u64,
  pub timed_out: u64,
  pub panicked: u64,
  pub cancelled: u64,
  pub total_exec_time: Duration,
  pub pool_size: usize,
  pub queue_size: usize,
  pub queue_capacity: usize,
  pub active_tasks: usize,
}

impl PoolStats {
  /// Tasks that have finished executing, successfully or not.
  pub fn completed(&self) -> u64 {
    self.succeeded + self.failed
  }

  /// Cumulative execution time divided by admitted tasks; zero before any
  /// task was admitted. Tasks still queued or running lower the average until
  /// they finish.
  pub fn avg_exec_time(&self) -> Duration {
    match u32::try_from(self.admitted) {
      Ok(0) => Duration::ZERO,
      Ok(n) => self.total_exec_time / n,
      Err(_) => Duration::from_secs_f64(self.total_exec_time.as_secs_f64() / self.admitted as f64),
    }
  }

  /// Named numeric view of the snapshot.
  pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
    BTreeMap::from([
      ("total_tasks", self.admitted as f64),
      ("completed_tasks", self.completed() as f64),
      ("admitted_tasks", self.admitted as f64),
      ("success_tasks", self.succeeded as f64),
      ("failure_tasks", self.failed as f64),
      ("timeout_tasks", self.timed_out as f64),
      ("panicked_tasks", self.panicked as f64),
      ("cancelled_tasks", self.cancelled as f64),
      ("rejected_tasks", self.rejected as f64),
      ("active_tasks", self.active_tasks as f64),
      ("pool_size", self.pool_size as f64),
      ("queue_size", self.queue_size as f64),
      ("queue_capacity", self.queue_capacity as f64),
      ("avg_exec_time_ms", self.avg_exec_time().as_secs_f64() * 1000.0),
    ])
  }
}

/// Counters for one consumer, shared by all of its fetch loops.
#[derive(Debug, Default)]
pub(crate) struct ConsumerMetrics {
  fetched: AtomicU64,
  fetch_errors: AtomicU64,
  handled: AtomicU64,
  handler_retries: AtomicU64,
  handler_failures: AtomicU64,
  abandoned: AtomicU64,
  committed: AtomicU64,
  commit_failures: AtomicU64,
  commits_skipped: AtomicU64,
}

impl ConsumerMetrics {
  pub(crate) fn record_fetched(&self) {
    self.fetched.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_fetch_error(&self) {
    self.fetch_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_handled(&self) {
    self.handled.fetch_add(1, Ordering::Relaxed);
  }

  /// A failed handler attempt that will be followed by another one.
  pub(crate) fn record_handler_retry(&self) {
    self.handler_retries.fetch_add(1, Ordering::Relaxed);
  }

  /// A message whose handler exhausted every attempt.
  pub(crate) fn record_handler_failure(&self) {
    self.handler_failures.fetch_add(1, Ordering::Relaxed);
  }

  /// A message dropped mid-retry because the consumer was stopping.
  pub(crate) fn record_abandoned(&self) {
    self.abandoned.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_committed(&self) {
    self.committed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_commit_failure(&self) {
    self.commit_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_commit_skipped(&self) {
    self.commits_skipped.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self) -> ConsumerStats {
    ConsumerStats {
      fetched: self.fetched.load(Ordering::Relaxed),
      fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
      handled: self.handled.load(Ordering::Relaxed),
      handler_retries: self.handler_retries.load(Ordering::Relaxed),
      handler_failures: self.handler_failures.load(Ordering::Relaxed),
      abandoned: self.abandoned.load(Ordering::Relaxed),
      committed: self.committed.load(Ordering::Relaxed),
      commit_failures: self.commit_failures.load(Ordering::Relaxed),
      commits_skipped: self.commits_skipped.load(Ordering::Relaxed),
    }
  }
}

/// Snapshot of a consumer's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
  pub fetched: u64,
  pub fetch_errors: u64,
  /// Messages whose handler eventually succeeded.
  pub handled: u64,
  /// Failed attempts that were followed by another attempt.
  pub handler_retries: u64,
  /// Messages whose handler gave up after the last attempt.
  pub handler_failures: u64,
  pub abandoned: u64,
  pub committed: u64,
  pub commit_failures: u64,
  pub commits_skipped: u64,
}

impl ConsumerStats {
  /// Commits attempted, whether or not they eventually succeeded.
  pub fn commits_attempted(&self) -> u64 {
    self.committed + self.commit_failures
  }
}
