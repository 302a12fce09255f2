use std::time::Duration;

use thiserror::Error;

/// Boxed error type produced by task bodies and message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the `WorkerPool` API itself.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  InvalidConfig(String),

  #[error("Task queue is at capacity, task rejected")]
  QueueFull,

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,
}

/// Why a task did not complete successfully. Delivered to `Task::on_error`.
#[derive(Error, Debug)]
pub enum TaskFailure {
  #[error("Task returned an error: {0}")]
  Failed(#[source] BoxError),

  #[error("Task panicked during execution: {0}")]
  Panicked(String),

  #[error("Task exceeded its deadline of {0:?}")]
  TimedOut(Duration),

  #[error("Task was cancelled before it could complete")]
  Cancelled,
}

impl TaskFailure {
  pub fn is_timeout(&self) -> bool {
    matches!(self, TaskFailure::TimedOut(_))
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskFailure::Panicked(_))
  }
}

/// Validation and lifecycle errors for consumers and the consumer manager.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsumerError {
  #[error("No brokers configured")]
  NoBrokers,

  #[error("Topic must not be empty")]
  EmptyTopic,

  #[error("Consumer group id must not be empty")]
  EmptyGroup,

  #[error("Consumer manager already started, consumers must be added before start")]
  AlreadyStarted,

  #[error("No consumers registered, add at least one consumer before start")]
  NoConsumers,

  #[error("Failed to open message source: {0}")]
  Connect(String),
}

/// Failure of a single `MessageSource::fetch` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Fetch interrupted by cancellation")]
  Cancelled,

  #[error("Transient fetch failure: {0}")]
  Transient(String),

  #[error("Fetch failed: {0}")]
  Failed(String),
}

/// Failure of a single handler attempt.
#[derive(Error, Debug)]
pub enum HandlerError {
  #[error("Handler returned an error: {0}")]
  Failed(#[source] BoxError),

  #[error("Handler panicked: {0}")]
  Panicked(String),

  #[error("Handler exceeded its attempt timeout of {0:?}")]
  TimedOut(Duration),
}

/// Failure of a single `MessageSource::commit` attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
  #[error("Commit interrupted by cancellation")]
  Cancelled,

  #[error("Commit exceeded its attempt timeout of {0:?}")]
  TimedOut(Duration),

  #[error("Commit failed: {0}")]
  Failed(String),
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
