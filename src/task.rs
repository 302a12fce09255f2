use crate::error::{BoxError, TaskFailure};

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A unit of work executed by the `WorkerPool`.
///
/// `execute` runs on a worker slot under a deadline. Exactly one of
/// `on_complete` / `on_error` is invoked afterwards, synchronously on the same
/// worker slot.
pub trait Task<R>: Send {
  /// Runs the task. Long-running tasks should watch `ctx.token()` so they can
  /// stop early when the deadline passes or the pool is forcefully shut down.
  fn execute(&mut self, ctx: TaskContext) -> BoxFuture<'_, Result<R, BoxError>>;

  fn on_complete(&mut self, result: R);

  fn on_error(&mut self, error: TaskFailure);

  /// Per-task override of the pool's task timeout.
  fn timeout(&self) -> Option<Duration> {
    None
  }
}

impl<R, T: Task<R> + ?Sized> Task<R> for Box<T> {
  fn execute(&mut self, ctx: TaskContext) -> BoxFuture<'_, Result<R, BoxError>> {
    (**self).execute(ctx)
  }

  fn on_complete(&mut self, result: R) {
    (**self).on_complete(result)
  }

  fn on_error(&mut self, error: TaskFailure) {
    (**self).on_error(error)
  }

  fn timeout(&self) -> Option<Duration> {
    (**self).timeout()
  }
}

/// Execution context handed to `Task::execute`.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub(crate) task_id: u64,
  pub(crate) token: CancellationToken,
  pub(crate) deadline: Instant,
}

impl TaskContext {
  pub fn task_id(&self) -> u64 {
    self.task_id
  }

  /// Token cancelled when the task times out or the pool is forcefully shut down.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn remaining(&self) -> Duration {
    self.deadline.saturating_duration_since(Instant::now())
  }
}

/// Internal representation of a task sitting in the admission queue.
pub(crate) struct QueuedTask<R> {
  pub(crate) task_id: u64,
  pub(crate) task: Box<dyn Task<R>>,
  pub(crate) enqueued_at: Instant,
}
