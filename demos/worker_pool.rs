use futures::future::BoxFuture;
use std::time::Duration;
use taskfleet::{BoxError, PoolConfig, Task, TaskContext, TaskFailure, WorkerPool};
use tokio::runtime::Handle;
use tracing::{info, warn};

struct ResizeImage {
  id: usize,
  delay_ms: u64,
  fail: bool,
}

impl Task<String> for ResizeImage {
  fn execute(&mut self, ctx: TaskContext) -> BoxFuture<'_, Result<String, BoxError>> {
    Box::pin(async move {
      info!("Task {} (pool id {}) starting, will take {}ms", self.id, ctx.task_id(), self.delay_ms);
      tokio::select! {
        _ = ctx.token().cancelled() => return Err("cancelled before finishing".into()),
        _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => {}
      }
      if self.fail {
        return Err(format!("image {} is corrupt", self.id).into());
      }
      Ok(format!("image {} resized", self.id))
    })
  }

  fn on_complete(&mut self, result: String) {
    info!("Task {} completed: {}", self.id, result);
  }

  fn on_error(&mut self, error: TaskFailure) {
    warn!("Task {} failed: {}", self.id, error);
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Worker Pool Example ---");

  let config = PoolConfig::new("image_pool", 3, 2, Duration::from_millis(800));
  let pool = WorkerPool::<String>::new(config, Handle::current()).expect("valid pool config");
  pool.start_with_default_timeout();

  for id in 1..=6 {
    // Task 5 runs past the pool's deadline; task 2 fails outright.
    let delay_ms = if id == 5 { 2_000 } else { 100 + (id as u64 % 3) * 100 };
    let task = ResizeImage { id, delay_ms, fail: id == 2 };
    match pool.try_add_task(task) {
      Ok(task_id) => info!("Submitted task {} as pool task {}", id, task_id),
      Err(e) => warn!("Task {} rejected: {}", id, e),
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
  }

  let stats = pool.stop().await;
  for (name, value) in stats.as_map() {
    info!("{:>16}: {}", name, value);
  }
  info!("--- Worker Pool Example End ---");
}
