use crate::config::PoolConfig;
use crate::error::{panic_message, PoolError, TaskFailure};
use crate::metrics::{PoolGauges, PoolMetrics, PoolStats};
use crate::task::{QueuedTask, Task, TaskContext};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, trace, warn, Dispatch, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops admission and lets the worker slots drain every queued task.
  Graceful,
  /// Stops admission, cancels running tasks and fails queued tasks with
  /// `TaskFailure::Cancelled` without running them.
  ForcefulCancel,
}

/// State shared between the pool handle and its worker slots.
struct PoolShared {
  pool_name: Arc<String>,
  metrics: PoolMetrics,
  active_tasks: DashMap<u64, CancellationToken>,
  force_token: CancellationToken,
}

/// A fixed-size pool of worker slots draining a bounded FIFO admission queue.
pub struct WorkerPool<R: Send + 'static> {
  config: PoolConfig,
  shared: Arc<PoolShared>,
  producer: QueueProducer<R>,
  consumer: QueueConsumer<R>,
  shutdown_token: CancellationToken,
  started: AtomicBool,
  /// Serializes `start` against the first step of shutdown.
  lifecycle: Mutex<()>,
  /// Completion barrier for the worker slots, awaited by every shutdown call.
  slots: TaskTracker,
  tokio_handle: TokioHandle,
  dispatch: Dispatch,
}

impl<R: Send + 'static> WorkerPool<R> {
  /// Creates a pool that logs to the current default `tracing` dispatcher.
  pub fn new(config: PoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
    Self::with_dispatch(config, tokio_handle, dispatch)
  }

  /// Creates a pool whose log output, including that of its worker slots,
  /// goes to `dispatch`.
  pub fn with_dispatch(config: PoolConfig, tokio_handle: TokioHandle, dispatch: Dispatch) -> Result<Arc<Self>, PoolError> {
    config.validate()?;
    let (producer, consumer) = TaskQueue::new(config.queue_capacity).split();

    Ok(Arc::new(Self {
      shared: Arc::new(PoolShared {
        pool_name: Arc::new(config.name.clone()),
        metrics: PoolMetrics::default(),
        active_tasks: DashMap::new(),
        force_token: CancellationToken::new(),
      }),
      config,
      producer,
      consumer,
      shutdown_token: CancellationToken::new(),
      started: AtomicBool::new(false),
      lifecycle: Mutex::new(()),
      slots: TaskTracker::new(),
      tokio_handle,
      dispatch,
    }))
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn is_started(&self) -> bool {
    self.started.load(AtomicOrdering::Acquire)
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  pub fn active_task_count(&self) -> usize {
    self.shared.active_tasks.len()
  }

  /// Returns the current number of tasks in the admission queue.
  pub fn queued_task_count(&self) -> usize {
    self.producer.len()
  }

  /// Non-blocking submission. Returns `false` if the pool is shutting down or
  /// the queue is full; the reason is logged.
  pub fn add_task<T: Task<R> + 'static>(&self, task: T) -> bool {
    self.try_add_task(task).is_ok()
  }

  /// Non-blocking submission returning the assigned task id, or why the task
  /// was rejected. A rejected task is dropped without any callback.
  pub fn try_add_task<T: Task<R> + 'static>(&self, task: T) -> Result<u64, PoolError> {
    tracing::dispatcher::with_default(&self.dispatch, || {
      if self.shutdown_token.is_cancelled() {
        self.shared.metrics.record_rejected();
        warn!(pool_name = %*self.shared.pool_name, "AddTask: Pool is shutting down, task rejected.");
        return Err(PoolError::PoolShuttingDown);
      }

      let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
      let queued = QueuedTask {
        task_id,
        task: Box::new(task),
        enqueued_at: Instant::now(),
      };

      match self.producer.try_push(queued) {
        Ok(()) => {
          self.shared.metrics.record_admitted();
          debug!(pool_name = %*self.shared.pool_name, %task_id, queued = self.producer.len(), "Task admitted to queue.");
          Ok(task_id)
        }
        Err((reason, _rejected)) => {
          self.shared.metrics.record_rejected();
          warn!(pool_name = %*self.shared.pool_name, %task_id, "AddTask: Task rejected: {}", reason);
          Err(reason)
        }
      }
    })
  }

  /// Spawns `pool_size` worker slots. `task_timeout` applies to every task
  /// that does not override it. Calling `start` again is a no-op.
  pub fn start(&self, task_timeout: Duration) {
    tracing::dispatcher::with_default(&self.dispatch, || {
      let _lifecycle = self.lifecycle.lock();
      if self.shutdown_token.is_cancelled() {
        warn!(pool_name = %*self.shared.pool_name, "Start: Pool already shut down, not starting worker slots.");
        return;
      }
      if self.started.swap(true, AtomicOrdering::AcqRel) {
        warn!(pool_name = %*self.shared.pool_name, "Start: Pool already started.");
        return;
      }

      info!(
        pool_name = %*self.shared.pool_name,
        pool_size = self.config.pool_size,
        queue_capacity = self.config.queue_capacity,
        ?task_timeout,
        "Starting worker pool."
      );

      for worker_id in 1..=self.config.pool_size {
        let shared = self.shared.clone();
        let queue = self.consumer.clone();
        let slot = Self::run_worker_slot(worker_id, shared, queue, task_timeout)
          .instrument(info_span!("worker_slot", pool_name = %*self.shared.pool_name, worker_id))
          .with_subscriber(self.dispatch.clone());
        self.slots.spawn_on(slot, &self.tokio_handle);
      }
      self.slots.close();
    })
  }

  /// Starts the pool with the configured default task timeout.
  pub fn start_with_default_timeout(&self) {
    self.start(self.config.default_task_timeout());
  }

  /// Point-in-time snapshot. Counters are read individually and may be
  /// slightly skewed relative to each other.
  pub fn stats(&self) -> PoolStats {
    self.shared.metrics.snapshot(PoolGauges {
      pool_size: self.config.pool_size,
      queue_size: self.producer.len(),
      queue_capacity: self.producer.capacity(),
      active_tasks: self.shared.active_tasks.len(),
    })
  }

  /// Same snapshot as `stats`, keyed by metric name.
  pub fn get_stats(&self) -> BTreeMap<&'static str, f64> {
    self.stats().as_map()
  }

  pub fn reset_stats(&self) {
    self.shared.metrics.reset();
  }

  /// Graceful shutdown; see `shutdown`.
  pub async fn stop(&self) -> PoolStats {
    self.shutdown(ShutdownMode::Graceful).await
  }

  /// Stops admission, closes the queue and waits for every worker slot to
  /// exit, then logs and returns the final stats.
  ///
  /// Safe to call repeatedly, also concurrently; only the first call closes
  /// the queue, and every call waits for the worker slots to exit.
  pub async fn shutdown(&self, mode: ShutdownMode) -> PoolStats {
    self.shutdown_internal(mode).with_subscriber(self.dispatch.clone()).await
  }

  async fn shutdown_internal(&self, mode: ShutdownMode) -> PoolStats {
    let pool_name = self.shared.pool_name.clone();
    {
      let _lifecycle = self.lifecycle.lock();
      self.shutdown_token.cancel();
      // A pool that never started has no slots to wait for.
      self.slots.close();
      if self.producer.close() {
        info!(pool_name = %*pool_name, "Initiating pool shutdown (mode: {:?}). Admission queue closed.", mode);
      } else {
        info!(pool_name = %*pool_name, "Shutdown already in progress or completed (mode: {:?}).", mode);
      }
    }

    if mode == ShutdownMode::ForcefulCancel {
      self.shared.force_token.cancel();
      let mut cancelled = 0usize;
      for entry in self.shared.active_tasks.iter() {
        debug!(pool_name = %*pool_name, task_id = *entry.key(), "Forcefully cancelling active task.");
        entry.value().cancel();
        cancelled += 1;
      }
      info!(pool_name = %*pool_name, "Forceful shutdown: cancelled {} active task(s).", cancelled);
    }

    if !self.slots.is_empty() {
      info!(pool_name = %*pool_name, "Waiting for {} worker slot(s) to exit.", self.slots.len());
    }
    self.slots.wait().await;

    // Whatever is still queued will never run: the pool was never started,
    // or the shutdown was forceful.
    let mut discarded = 0usize;
    while let Some(queued) = self.consumer.try_recv() {
      Self::discard_task(&self.shared, queued);
      discarded += 1;
    }
    if discarded > 0 {
      info!(pool_name = %*pool_name, "Discarded {} queued task(s) that never ran.", discarded);
    }

    let stats = self.stats();
    info!(
      pool_name = %*pool_name,
      admitted = stats.admitted,
      succeeded = stats.succeeded,
      failed = stats.failed,
      timed_out = stats.timed_out,
      panicked = stats.panicked,
      cancelled = stats.cancelled,
      rejected = stats.rejected,
      avg_exec_time_ms = stats.avg_exec_time().as_secs_f64() * 1000.0,
      "Pool shutdown complete. Final metrics."
    );
    stats
  }

  async fn run_worker_slot(worker_id: usize, shared: Arc<PoolShared>, queue: QueueConsumer<R>, task_timeout: Duration) {
    debug!(pool_name = %*shared.pool_name, worker_id, "Worker slot started.");

    loop {
      let queued = tokio::select! {
        biased;

        _ = shared.force_token.cancelled() => {
          info!(pool_name = %*shared.pool_name, worker_id, "Forceful shutdown observed. Worker slot exiting.");
          break;
        }

        received = queue.recv() => match received {
          Ok(queued) => queued,
          Err(_) => {
            debug!(pool_name = %*shared.pool_name, worker_id, "Task queue closed and drained. Worker slot exiting.");
            break;
          }
        }
      };

      Self::execute_task(worker_id, &shared, queued, task_timeout).await;
    }
  }

  async fn execute_task(worker_id: usize, shared: &PoolShared, queued: QueuedTask<R>, default_timeout: Duration) {
    let QueuedTask {
      task_id,
      mut task,
      enqueued_at,
    } = queued;

    let timeout = task.timeout().unwrap_or(default_timeout);
    let started = Instant::now();
    let deadline = started
      .checked_add(timeout)
      .unwrap_or_else(|| started + Duration::from_secs(60 * 60 * 24 * 365));
    // Fresh per-task token: the pool's shutdown token must not abort tasks
    // during a graceful drain.
    let token = CancellationToken::new();
    shared.active_tasks.insert(task_id, token.clone());
    trace!(
      pool_name = %*shared.pool_name,
      worker_id,
      %task_id,
      queued_for = ?started.duration_since(enqueued_at),
      "Dequeued task."
    );

    let ctx = TaskContext {
      task_id,
      token: token.clone(),
      deadline,
    };

    let outcome: Result<R, TaskFailure> = {
      let task_ref = &mut task;
      // Building the future happens inside the async block so that a panic
      // raised synchronously by `execute` is caught too.
      let execution = AssertUnwindSafe(async move { task_ref.execute(ctx).await }).catch_unwind();

      tokio::select! {
        biased;

        finished = execution => match finished {
          Ok(Ok(value)) => Ok(value),
          Ok(Err(task_error)) => Err(TaskFailure::Failed(task_error)),
          Err(panic_payload) => Err(TaskFailure::Panicked(panic_message(&*panic_payload))),
        },

        _ = tokio::time::sleep_until(deadline) => {
          // Dropping the execution future aborts the task; the token tells
          // any work it handed off to stop as well.
          token.cancel();
          Err(TaskFailure::TimedOut(timeout))
        },

        _ = token.cancelled() => Err(TaskFailure::Cancelled),

        // Covers a task dequeued while a forceful shutdown was walking the
        // active map, before its token was registered there.
        _ = shared.force_token.cancelled() => {
          token.cancel();
          Err(TaskFailure::Cancelled)
        },
      }
    };

    shared.active_tasks.remove(&task_id);
    let elapsed = started.elapsed();
    shared.metrics.record_exec_time(elapsed);

    match &outcome {
      Ok(_) => {
        shared.metrics.record_success();
        debug!(pool_name = %*shared.pool_name, worker_id, %task_id, ?elapsed, "Task completed successfully.");
      }
      Err(failure) => {
        shared.metrics.record_failure();
        match failure {
          TaskFailure::TimedOut(_) => shared.metrics.record_timeout(),
          TaskFailure::Panicked(_) => shared.metrics.record_panic(),
          TaskFailure::Cancelled => shared.metrics.record_cancelled(),
          TaskFailure::Failed(_) => {}
        }
        if failure.is_panic() {
          error!(pool_name = %*shared.pool_name, worker_id, %task_id, ?elapsed, "Task failed: {}", failure);
        } else {
          warn!(pool_name = %*shared.pool_name, worker_id, %task_id, ?elapsed, "Task failed: {}", failure);
        }
      }
    }

    Self::deliver_outcome(&shared.pool_name, task_id, &mut task, outcome);
  }

  fn discard_task(shared: &PoolShared, queued: QueuedTask<R>) {
    let QueuedTask { task_id, mut task, .. } = queued;
    shared.metrics.record_failure();
    shared.metrics.record_cancelled();
    debug!(pool_name = %*shared.pool_name, %task_id, "Queued task cancelled by shutdown.");
    Self::deliver_outcome(&shared.pool_name, task_id, &mut task, Err(TaskFailure::Cancelled));
  }

  /// Invokes the matching callback, containing any panic it raises.
  fn deliver_outcome(pool_name: &str, task_id: u64, task: &mut Box<dyn Task<R>>, outcome: Result<R, TaskFailure>) {
    let callback = std::panic::catch_unwind(AssertUnwindSafe(|| match outcome {
      Ok(value) => task.on_complete(value),
      Err(failure) => task.on_error(failure),
    }));
    if let Err(panic_payload) = callback {
      error!(pool_name = %pool_name, %task_id, "Task callback panicked: {}", panic_message(&*panic_payload));
    }
  }
}

impl<R: Send + 'static> Drop for WorkerPool<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      tracing::dispatcher::with_default(&self.dispatch, || {
        info!(
          pool_name = %*self.shared.pool_name,
          "WorkerPool dropped without shutdown. Closing admission queue; worker slots drain and exit on their own."
        );
      });
      self.shutdown_token.cancel();
      let _ = self.producer.close();
    }
  }
}
