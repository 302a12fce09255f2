use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskfleet::{BoxError, PoolConfig, PoolError, ShutdownMode, Task, TaskContext, TaskFailure, WorkerPool};
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
  Completed(String),
  Failed,
  TimedOut,
  Panicked,
  Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
  Succeed,
  Fail,
  Panic,
}

type OutcomeLog = Arc<Mutex<Vec<(usize, Outcome)>>>;

struct ScriptedTask {
  id: usize,
  duration_ms: u64,
  behavior: Behavior,
  timeout: Option<Duration>,
  outcomes: OutcomeLog,
}

impl ScriptedTask {
  fn new(id: usize, duration_ms: u64, behavior: Behavior, outcomes: &OutcomeLog) -> Self {
    Self {
      id,
      duration_ms,
      behavior,
      timeout: None,
      outcomes: outcomes.clone(),
    }
  }

  fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

impl Task<String> for ScriptedTask {
  fn execute(&mut self, ctx: TaskContext) -> BoxFuture<'_, Result<String, BoxError>> {
    Box::pin(async move {
      tracing::info!("Task {} running, {:?} left before deadline.", self.id, ctx.remaining());
      sleep(Duration::from_millis(self.duration_ms)).await;
      match self.behavior {
        Behavior::Succeed => Ok(format!("task_{}_done", self.id)),
        Behavior::Fail => Err(format!("task {} failed on purpose", self.id).into()),
        Behavior::Panic => panic!("Task {} intentionally panicked!", self.id),
      }
    })
  }

  fn on_complete(&mut self, result: String) {
    self.outcomes.lock().push((self.id, Outcome::Completed(result)));
  }

  fn on_error(&mut self, error: TaskFailure) {
    let outcome = match error {
      TaskFailure::Failed(_) => Outcome::Failed,
      TaskFailure::TimedOut(_) => Outcome::TimedOut,
      TaskFailure::Panicked(_) => Outcome::Panicked,
      TaskFailure::Cancelled => Outcome::Cancelled,
    };
    self.outcomes.lock().push((self.id, outcome));
  }

  fn timeout(&self) -> Option<Duration> {
    self.timeout
  }
}

// Helper to initialize tracing for tests; Once keeps it to a single init per binary.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,taskfleet=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn new_pool(name: &str, pool_size: usize, queue_capacity: usize, timeout: Duration) -> Arc<WorkerPool<String>> {
  WorkerPool::new(
    PoolConfig::new(name, pool_size, queue_capacity, timeout),
    tokio::runtime::Handle::current(),
  )
  .expect("valid pool config")
}

/// Submits, waiting for queue room while the pool is merely full.
async fn submit_when_room(pool: &WorkerPool<String>, mut make_task: impl FnMut() -> ScriptedTask) -> u64 {
  loop {
    match pool.try_add_task(make_task()) {
      Ok(task_id) => return task_id,
      Err(PoolError::QueueFull) => sleep(Duration::from_millis(5)).await,
      Err(other) => panic!("unexpected rejection: {other}"),
    }
  }
}

#[tokio::test]
async fn test_five_tasks_one_failure_on_three_slots() {
  setup_tracing_for_test();
  let pool_name = "test_pool_mixed_outcomes";
  tracing::info!("Starting test: {}", pool_name);
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool(pool_name, 3, 2, Duration::from_secs(2));
  pool.start_with_default_timeout();

  for id in 1..=5 {
    let behavior = if id == 2 { Behavior::Fail } else { Behavior::Succeed };
    submit_when_room(&pool, || ScriptedTask::new(id, 20, behavior, &outcomes)).await;
  }

  let stats = pool.stop().await;
  assert_eq!(stats.succeeded, 4);
  assert_eq!(stats.failed, 1);
  assert_eq!(stats.admitted, 5);

  let map = pool.get_stats();
  assert_eq!(map["failure_tasks"], 1.0);
  assert_eq!(map["success_tasks"], 4.0);
  assert_eq!(map["total_tasks"], 5.0);
  assert_eq!(map["pool_size"], 3.0);
  assert!(map["avg_exec_time_ms"] >= 20.0);

  let recorded = outcomes.lock().clone();
  assert_eq!(recorded.len(), 5);
  assert!(recorded.contains(&(2, Outcome::Failed)));
  assert!(recorded.contains(&(5, Outcome::Completed("task_5_done".to_string()))));
  tracing::info!("Finished test: {}", pool_name);
}

#[tokio::test]
async fn test_timeout_calls_on_error_and_never_on_complete() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_timeout", 1, 4, Duration::from_millis(50));
  pool.start_with_default_timeout();

  let started = Instant::now();
  assert!(pool.add_task(ScriptedTask::new(1, 5_000, Behavior::Succeed, &outcomes)));
  // Per-task override shorter than the pool default.
  assert!(pool.add_task(ScriptedTask::new(2, 5_000, Behavior::Succeed, &outcomes).with_timeout(Duration::from_millis(10))));

  let stats = pool.stop().await;
  assert!(started.elapsed() < Duration::from_secs(2));
  assert_eq!(*outcomes.lock(), vec![(1, Outcome::TimedOut), (2, Outcome::TimedOut)]);
  assert_eq!(stats.timed_out, 2);
  assert_eq!(stats.failed, 2);
  assert_eq!(stats.succeeded, 0);
  assert_eq!(stats.active_tasks, 0);
}

#[tokio::test]
async fn test_panicking_task_does_not_take_down_its_worker() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_panic", 1, 4, Duration::from_secs(2));
  pool.start_with_default_timeout();

  assert!(pool.add_task(ScriptedTask::new(1, 5, Behavior::Panic, &outcomes)));
  assert!(pool.add_task(ScriptedTask::new(2, 5, Behavior::Succeed, &outcomes)));

  let stats = pool.stop().await;
  assert_eq!(
    *outcomes.lock(),
    vec![(1, Outcome::Panicked), (2, Outcome::Completed("task_2_done".to_string()))]
  );
  assert_eq!(stats.panicked, 1);
  assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn test_rejections_distinguish_full_from_shutting_down() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_rejections", 1, 1, Duration::from_secs(1));

  assert!(pool.try_add_task(ScriptedTask::new(1, 5, Behavior::Succeed, &outcomes)).is_ok());
  assert_eq!(
    pool.try_add_task(ScriptedTask::new(2, 5, Behavior::Succeed, &outcomes)).err(),
    Some(PoolError::QueueFull)
  );

  // Never started: the queued task is failed with Cancelled, exactly once.
  let stats = pool.stop().await;
  assert_eq!(*outcomes.lock(), vec![(1, Outcome::Cancelled)]);
  assert_eq!(stats.cancelled, 1);

  assert_eq!(
    pool.try_add_task(ScriptedTask::new(3, 5, Behavior::Succeed, &outcomes)).err(),
    Some(PoolError::PoolShuttingDown)
  );
  assert!(!pool.add_task(ScriptedTask::new(4, 5, Behavior::Succeed, &outcomes)));
  assert_eq!(pool.stats().rejected, 3);

  // Starting after shutdown does nothing.
  pool.start_with_default_timeout();
  assert!(!pool.is_started());
}

#[tokio::test]
async fn test_forceful_shutdown_cancels_running_and_queued_tasks() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_forceful", 1, 4, Duration::from_secs(30));
  pool.start_with_default_timeout();

  assert!(pool.add_task(ScriptedTask::new(1, 10_000, Behavior::Succeed, &outcomes)));
  assert!(pool.add_task(ScriptedTask::new(2, 10_000, Behavior::Succeed, &outcomes)));
  assert!(pool.add_task(ScriptedTask::new(3, 10_000, Behavior::Succeed, &outcomes)));

  let wait_started = Instant::now();
  while pool.active_task_count() == 0 {
    assert!(wait_started.elapsed() < Duration::from_secs(2), "first task never started");
    sleep(Duration::from_millis(2)).await;
  }

  let started = Instant::now();
  let stats = pool.shutdown(ShutdownMode::ForcefulCancel).await;
  assert!(started.elapsed() < Duration::from_secs(2));

  let mut recorded = outcomes.lock().clone();
  recorded.sort_by_key(|(id, _)| *id);
  assert_eq!(
    recorded,
    vec![(1, Outcome::Cancelled), (2, Outcome::Cancelled), (3, Outcome::Cancelled)]
  );
  assert_eq!(stats.cancelled, 3);
  assert_eq!(stats.succeeded, 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_double_stop", 2, 4, Duration::from_secs(1));
  pool.start_with_default_timeout();
  assert!(pool.add_task(ScriptedTask::new(1, 10, Behavior::Succeed, &outcomes)));

  let first = pool.stop().await;
  let second = pool.stop().await;
  assert_eq!(first, second);
  assert_eq!(outcomes.lock().len(), 1);
  assert!(pool.is_shutting_down());
}

#[tokio::test]
async fn test_concurrent_stops_both_wait_for_running_task() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_concurrent_stop", 1, 2, Duration::from_secs(5));
  pool.start_with_default_timeout();
  assert!(pool.add_task(ScriptedTask::new(1, 300, Behavior::Succeed, &outcomes)));

  let first_pool = pool.clone();
  let first = tokio::spawn(async move { first_pool.stop().await });
  sleep(Duration::from_millis(20)).await;
  let second = pool.stop().await;

  assert_eq!(second.succeeded, 1);
  assert_eq!(second.active_tasks, 0);
  assert_eq!(outcomes.lock().len(), 1);
  assert_eq!(first.await.unwrap().succeeded, 1);
}

struct GaugedTask {
  duration: Duration,
  running: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
  done: Arc<AtomicUsize>,
}

impl Task<()> for GaugedTask {
  fn execute(&mut self, _ctx: TaskContext) -> BoxFuture<'_, Result<(), BoxError>> {
    Box::pin(async move {
      let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now_running, Ordering::SeqCst);
      sleep(self.duration).await;
      self.running.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    })
  }

  fn on_complete(&mut self, _result: ()) {
    self.done.fetch_add(1, Ordering::SeqCst);
  }

  fn on_error(&mut self, error: TaskFailure) {
    panic!("unexpected failure: {error}");
  }
}

#[tokio::test]
async fn test_concurrency_never_exceeds_pool_size() {
  setup_tracing_for_test();
  let pool: Arc<WorkerPool<()>> = WorkerPool::new(
    PoolConfig::new("test_pool_concurrency", 2, 16, Duration::from_secs(2)),
    tokio::runtime::Handle::current(),
  )
  .unwrap();

  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let done = Arc::new(AtomicUsize::new(0));
  let mut rng = rand::rng();
  for _ in 0..12 {
    assert!(pool.add_task(GaugedTask {
      duration: Duration::from_millis(rng.random_range(5..25)),
      running: running.clone(),
      peak: peak.clone(),
      done: done.clone(),
    }));
  }

  pool.start_with_default_timeout();
  let stats = pool.stop().await;

  assert_eq!(done.load(Ordering::SeqCst), 12);
  assert_eq!(peak.load(Ordering::SeqCst), 2);
  assert_eq!(stats.succeeded, 12);
  assert_eq!(stats.queue_capacity, 16);
}

#[tokio::test]
async fn test_reset_stats_clears_counters() {
  setup_tracing_for_test();
  let outcomes: OutcomeLog = Arc::default();
  let pool = new_pool("test_pool_reset", 1, 2, Duration::from_secs(1));
  pool.start_with_default_timeout();
  assert!(pool.add_task(ScriptedTask::new(1, 1, Behavior::Fail, &outcomes)));

  let wait_started = Instant::now();
  while outcomes.lock().is_empty() {
    assert!(wait_started.elapsed() < Duration::from_secs(2));
    sleep(Duration::from_millis(2)).await;
  }

  pool.reset_stats();
  let map = pool.get_stats();
  assert_eq!(map["failure_tasks"], 0.0);
  assert_eq!(map["admitted_tasks"], 0.0);
  assert_eq!(map["queue_capacity"], 2.0);
  pool.stop().await;
}
