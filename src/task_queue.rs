use crate::error::PoolError;
use crate::task::QueuedTask;

use async_channel::{Receiver, RecvError, Sender, TrySendError};
use std::fmt;

/// A bounded, lock-free, multi-producer, multi-consumer FIFO of tasks.
///
/// Backed by a bounded `async_channel`. Admission never waits: a full queue
/// rejects immediately. Closing the queue stops admission while tasks already
/// queued stay receivable until drained.
pub(crate) struct TaskQueue<R> {
  tx: Sender<QueuedTask<R>>,
  rx: Receiver<QueuedTask<R>>,
}

impl<R> TaskQueue<R> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = async_channel::bounded(capacity);
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<R>, QueueConsumer<R>) {
    (QueueProducer { tx: self.tx }, QueueConsumer { rx: self.rx })
  }
}

/// Producer half, owned by the pool's submission path.
pub(crate) struct QueueProducer<R> {
  tx: Sender<QueuedTask<R>>,
}

/// Consumer half. Cloned once per worker slot.
pub(crate) struct QueueConsumer<R> {
  rx: Receiver<QueuedTask<R>>,
}

impl<R> Clone for QueueConsumer<R> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<R> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.capacity())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<R> QueueProducer<R> {
  /// Attempts to enqueue without waiting.
  ///
  /// On rejection the task is handed back so the caller can decide what to
  /// do with it.
  pub(crate) fn try_push(&self, task: QueuedTask<R>) -> Result<(), (PoolError, QueuedTask<R>)> {
    match self.tx.try_send(task) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(task)) => Err((PoolError::QueueFull, task)),
      Err(TrySendError::Closed(task)) => Err((PoolError::PoolShuttingDown, task)),
    }
  }

  /// Closes the queue. Returns `true` only for the call that actually closed it.
  pub(crate) fn close(&self) -> bool {
    self.tx.close()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  pub(crate) fn capacity(&self) -> usize {
    self.tx.capacity().unwrap_or(0)
  }
}

impl<R> QueueConsumer<R> {
  /// Waits for the next task. Fails only once the queue is closed and empty.
  pub(crate) async fn recv(&self) -> Result<QueuedTask<R>, RecvError> {
    self.rx.recv().await
  }

  /// Non-blocking receive, used to flush leftovers during shutdown.
  pub(crate) fn try_recv(&self) -> Option<QueuedTask<R>> {
    self.rx.try_recv().ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{BoxError, TaskFailure};
  use crate::task::{Task, TaskContext};
  use futures::future::BoxFuture;
  use std::time::Duration;
  use tokio::time::Instant;

  struct Noop;

  impl Task<()> for Noop {
    fn execute(&mut self, _ctx: TaskContext) -> BoxFuture<'_, Result<(), BoxError>> {
      Box::pin(async { Ok(()) })
    }
    fn on_complete(&mut self, _result: ()) {}
    fn on_error(&mut self, _error: TaskFailure) {}
  }

  fn queued(id: u64) -> QueuedTask<()> {
    QueuedTask {
      task_id: id,
      task: Box::new(Noop),
      enqueued_at: Instant::now(),
    }
  }

  #[tokio::test]
  async fn test_queue_is_fifo() {
    let (producer, consumer) = TaskQueue::<()>::new(3).split();
    for id in 1..=3 {
      assert!(producer.try_push(queued(id)).is_ok());
    }
    assert_eq!(producer.len(), 3);

    for expected in 1..=3 {
      assert_eq!(consumer.recv().await.unwrap().task_id, expected);
    }
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_full_queue_rejects_without_waiting() {
    let (producer, _consumer) = TaskQueue::<()>::new(1).split();
    assert!(producer.try_push(queued(1)).is_ok());

    let started = Instant::now();
    match producer.try_push(queued(2)) {
      Err((PoolError::QueueFull, task)) => assert_eq!(task.task_id, 2),
      other => panic!("expected QueueFull, got ok={}", other.is_ok()),
    }
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(producer.capacity(), 1);
  }

  #[tokio::test]
  async fn test_close_rejects_new_tasks_but_keeps_queued_ones() {
    let (producer, consumer) = TaskQueue::<()>::new(2).split();
    assert!(producer.try_push(queued(1)).is_ok());

    assert!(producer.close());
    assert!(!producer.close(), "second close must report already closed");
    assert!(producer.is_closed());

    assert!(matches!(producer.try_push(queued(2)), Err((PoolError::PoolShuttingDown, _))));

    assert_eq!(consumer.recv().await.unwrap().task_id, 1);
    assert!(consumer.recv().await.is_err());
    assert!(consumer.try_recv().is_none());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_consumers_share_the_queue() {
    let (producer, consumer) = TaskQueue::<()>::new(16).split();
    for id in 0..16 {
      assert!(producer.try_push(queued(id)).is_ok());
    }
    producer.close();

    let mut handles = Vec::new();
    for _ in 0..4 {
      let consumer = consumer.clone();
      handles.push(tokio::spawn(async move {
        let mut seen = 0usize;
        while consumer.recv().await.is_ok() {
          seen += 1;
        }
        seen
      }));
    }

    let mut total = 0;
    for handle in handles {
      total += handle.await.unwrap();
    }
    assert_eq!(total, 16);
  }
}
