//! A consumer for one topic/group subscription.
//!
//! Each consumer runs `concurrency` fetch loops against a shared
//! `MessageSource`. A loop fetches one message, runs the handler with retry,
//! then commits according to the configured `CommitPolicy`. All loops are
//! tracked by a `TaskTracker`, which acts as the consumer's completion barrier.

use crate::config::{BrokerConfig, CommitPolicy, ConsumerSettings};
use crate::error::{panic_message, CommitError, ConsumerError, FetchError, HandlerError};
use crate::metrics::{ConsumerMetrics, ConsumerStats};
use crate::retry::{run_with_retry, RetryOutcome};
use crate::source::{Message, MessageHandler, MessageSource, Subscription};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, trace, warn, Dispatch, Instrument};

pub struct Consumer {
  subscription: Subscription,
  handler: Arc<dyn MessageHandler>,
  source: Arc<dyn MessageSource>,
  settings: Arc<ConsumerSettings>,
  metrics: Arc<ConsumerMetrics>,
  /// Replaced by a child of the parent token on `start`.
  token: Mutex<CancellationToken>,
  tracker: TaskTracker,
  started: AtomicBool,
  dispatch: Dispatch,
}

impl Consumer {
  /// Validates the broker list and the subscription. Nothing is spawned until
  /// `start`.
  pub fn new(
    config: &BrokerConfig,
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn MessageSource>,
    settings: ConsumerSettings,
  ) -> Result<Self, ConsumerError> {
    config.validate()?;
    subscription.validate()?;
    let subscription = Subscription::new(&subscription.topic, &subscription.group, subscription.concurrency);

    Ok(Self {
      subscription,
      handler,
      source,
      settings: Arc::new(settings),
      metrics: Arc::new(ConsumerMetrics::default()),
      token: Mutex::new(CancellationToken::new()),
      tracker: TaskTracker::new(),
      started: AtomicBool::new(false),
      dispatch: tracing::dispatcher::get_default(Dispatch::clone),
    })
  }

  /// Routes this consumer's logs, including those of its fetch loops, to `dispatch`.
  pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
    self.dispatch = dispatch;
    self
  }

  /// Creates and starts a consumer in one step.
  pub fn spawn(
    parent: &CancellationToken,
    tokio_handle: &TokioHandle,
    config: &BrokerConfig,
    subscription: Subscription,
    handler: Arc<dyn MessageHandler>,
    source: Arc<dyn MessageSource>,
    settings: ConsumerSettings,
  ) -> Result<Arc<Self>, ConsumerError> {
    let consumer = Arc::new(Self::new(config, subscription, handler, source, settings)?);
    consumer.start(parent, tokio_handle);
    Ok(consumer)
  }

  pub fn subscription(&self) -> &Subscription {
    &self.subscription
  }

  pub fn is_started(&self) -> bool {
    self.started.load(AtomicOrdering::Acquire)
  }

  /// True once every fetch loop has exited (or the consumer was stopped
  /// before it ever started).
  pub fn is_finished(&self) -> bool {
    self.tracker.is_closed() && self.tracker.is_empty()
  }

  pub fn stats(&self) -> ConsumerStats {
    self.metrics.snapshot()
  }

  /// Spawns exactly `concurrency` fetch loops, stopped when `parent` or this
  /// consumer is cancelled. Calling `start` again is a no-op.
  pub fn start(&self, parent: &CancellationToken, tokio_handle: &TokioHandle) {
    tracing::dispatcher::with_default(&self.dispatch, || {
      let topic = self.subscription.topic.as_str();
      let group = self.subscription.group.as_str();

      if self.started.swap(true, AtomicOrdering::AcqRel) {
        warn!(topic, group, "Start: Consumer already started.");
        return;
      }

      let token = {
        let mut slot = self.token.lock();
        if slot.is_cancelled() {
          warn!(topic, group, "Start: Consumer was stopped before starting, no fetch loops spawned.");
          self.tracker.close();
          return;
        }
        let child = parent.child_token();
        *slot = child.clone();
        child
      };

      info!(topic, group, concurrency = self.subscription.concurrency, "Starting consumer.");

      for loop_id in 1..=self.subscription.concurrency {
        let fetch_loop = FetchLoop {
          loop_id,
          source: self.source.clone(),
          handler: self.handler.clone(),
          settings: self.settings.clone(),
          metrics: self.metrics.clone(),
          token: token.clone(),
        };
        let future = fetch_loop
          .run()
          .instrument(info_span!("fetch_loop", topic, group, loop_id))
          .with_subscriber(self.dispatch.clone());
        self.tracker.spawn_on(future, tokio_handle);
      }
      self.tracker.close();
    })
  }

  /// Cancels this consumer's loops and waits until all of them have exited.
  pub async fn stop(&self) {
    let token = self.token.lock().clone();
    token.cancel();
    // A consumer that never started has no loops to wait for.
    if !self.is_started() {
      self.tracker.close();
    }
    self.wait().await;
  }

  /// Waits until every fetch loop has exited.
  pub async fn wait(&self) {
    self.tracker.wait().await;
    tracing::dispatcher::with_default(&self.dispatch, || {
      debug!(topic = %self.subscription.topic, group = %self.subscription.group, "Consumer barrier cleared.");
    });
  }
}

impl Drop for Consumer {
  fn drop(&mut self) {
    let token = self.token.get_mut();
    if self.started.load(AtomicOrdering::Acquire) && !token.is_cancelled() {
      tracing::dispatcher::with_default(&self.dispatch, || {
        debug!(
          topic = %self.subscription.topic,
          group = %self.subscription.group,
          "Consumer dropped while running, cancelling its fetch loops."
        );
      });
      token.cancel();
    }
  }
}

/// How the handler phase of one message ended.
enum HandleOutcome {
  Handled,
  GaveUp,
  /// Cancellation fired between attempts; the message must not be committed.
  Abandoned,
}

struct FetchLoop {
  loop_id: usize,
  source: Arc<dyn MessageSource>,
  handler: Arc<dyn MessageHandler>,
  settings: Arc<ConsumerSettings>,
  metrics: Arc<ConsumerMetrics>,
  token: CancellationToken,
}

impl FetchLoop {
  async fn run(self) {
    debug!(loop_id = self.loop_id, "Fetch loop started.");

    loop {
      if self.token.is_cancelled() {
        debug!(loop_id = self.loop_id, "Stop signal observed before fetch.");
        break;
      }

      let message = match self.source.fetch(&self.token).await {
        Ok(message) => message,
        Err(FetchError::Cancelled) => {
          debug!(loop_id = self.loop_id, "Fetch cancelled.");
          break;
        }
        Err(FetchError::Transient(reason)) => {
          self.metrics.record_fetch_error();
          trace!(loop_id = self.loop_id, "Transient fetch error, retrying: {}", reason);
          tokio::task::yield_now().await;
          continue;
        }
        Err(fetch_error) => {
          self.metrics.record_fetch_error();
          warn!(loop_id = self.loop_id, "Fetch failed: {}", fetch_error);
          let backoff = self.settings.fetch_error_backoff();
          if !backoff.is_zero() {
            tokio::select! {
              biased;
              _ = self.token.cancelled() => break,
              _ = tokio::time::sleep(backoff) => {}
            }
          }
          continue;
        }
      };

      self.metrics.record_fetched();
      trace!(loop_id = self.loop_id, partition = message.partition, offset = message.offset, "Fetched message.");

      match self.handle(&message).await {
        HandleOutcome::Handled => self.commit(&message).await,
        HandleOutcome::GaveUp => match self.settings.commit_policy {
          CommitPolicy::Always => self.commit(&message).await,
          CommitPolicy::OnSuccess => {
            self.metrics.record_commit_skipped();
            info!(
              loop_id = self.loop_id,
              partition = message.partition,
              offset = message.offset,
              "Commit skipped for message whose handler gave up."
            );
          }
        },
        HandleOutcome::Abandoned => {
          self.metrics.record_abandoned();
          warn!(
            loop_id = self.loop_id,
            partition = message.partition,
            offset = message.offset,
            "Stopped during handler retries. Message left uncommitted."
          );
          break;
        }
      }
    }

    debug!(loop_id = self.loop_id, "Fetch loop exited.");
  }

  async fn handle(&self, message: &Message) -> HandleOutcome {
    let policy = &self.settings.handler_retry;
    let handler: &dyn MessageHandler = &*self.handler;
    let attempt_timeout = policy.attempt_timeout();

    let outcome = run_with_retry(
      policy,
      &self.token,
      |_| invoke_handler(handler, message, attempt_timeout),
      |attempt: u32, max: u32, handler_error: &HandlerError| {
        if attempt < max {
          self.metrics.record_handler_retry();
          warn!(
            loop_id = self.loop_id,
            offset = message.offset,
            "Handler failed (attempt {}/{}), retrying: {}",
            attempt,
            max,
            handler_error
          );
        }
      },
    )
    .await;

    match outcome {
      RetryOutcome::Succeeded { attempts } => {
        self.metrics.record_handled();
        if attempts > 1 {
          info!(loop_id = self.loop_id, offset = message.offset, "Handler succeeded after {} attempts.", attempts);
        } else {
          trace!(loop_id = self.loop_id, offset = message.offset, "Handler succeeded.");
        }
        HandleOutcome::Handled
      }
      RetryOutcome::Exhausted { error, attempts } => {
        self.metrics.record_handler_failure();
        error!(
          loop_id = self.loop_id,
          topic = %message.topic,
          partition = message.partition,
          offset = message.offset,
          attempts,
          "Handler failed after all retries: {}",
          error
        );
        HandleOutcome::GaveUp
      }
      RetryOutcome::Cancelled { .. } => HandleOutcome::Abandoned,
    }
  }

  async fn commit(&self, message: &Message) {
    let policy = &self.settings.commit_retry;
    let source: &dyn MessageSource = &*self.source;
    let attempt_timeout = self.settings.commit_attempt_timeout();

    let outcome = run_with_retry(
      policy,
      &self.token,
      |_| commit_once(source, message, attempt_timeout),
      |attempt: u32, max: u32, commit_error: &CommitError| {
        if attempt < max {
          warn!(
            loop_id = self.loop_id,
            offset = message.offset,
            "Commit failed (attempt {}/{}), retrying: {}",
            attempt,
            max,
            commit_error
          );
        }
      },
    )
    .await;

    match outcome {
      RetryOutcome::Succeeded { .. } => {
        self.metrics.record_committed();
        trace!(loop_id = self.loop_id, offset = message.offset, "Offset committed.");
      }
      RetryOutcome::Exhausted { error, attempts } => {
        self.metrics.record_commit_failure();
        error!(
          loop_id = self.loop_id,
          topic = %message.topic,
          partition = message.partition,
          offset = message.offset,
          attempts,
          "Commit failed after all retries: {}",
          error
        );
      }
      RetryOutcome::Cancelled { error, attempts } => {
        self.metrics.record_commit_failure();
        warn!(
          loop_id = self.loop_id,
          offset = message.offset,
          attempts,
          "Commit abandoned, consumer stopping. Last error: {}",
          error
        );
      }
    }
  }
}

/// One handler attempt. Panics count as a failed attempt.
async fn invoke_handler(handler: &dyn MessageHandler, message: &Message, timeout: Option<Duration>) -> Result<(), HandlerError> {
  let attempt = AssertUnwindSafe(async move { handler.handle(message).await }).catch_unwind();

  let finished = match timeout {
    Some(limit) => match tokio::time::timeout(limit, attempt).await {
      Ok(finished) => finished,
      Err(_) => return Err(HandlerError::TimedOut(limit)),
    },
    None => attempt.await,
  };

  match finished {
    Ok(Ok(())) => Ok(()),
    Ok(Err(handler_error)) => Err(HandlerError::Failed(handler_error)),
    Err(panic_payload) => Err(HandlerError::Panicked(panic_message(&*panic_payload))),
  }
}

/// One commit attempt under its own scope, so a message handled while the
/// consumer is stopping can still be committed. The scope is cancelled when
/// the attempt times out.
async fn commit_once(source: &dyn MessageSource, message: &Message, timeout: Duration) -> Result<(), CommitError> {
  let scope = CancellationToken::new();
  let _cancel_on_exit = scope.clone().drop_guard();
  match tokio::time::timeout(timeout, source.commit(&scope, message)).await {
    Ok(result) => result,
    Err(_) => Err(CommitError::TimedOut(timeout)),
  }
}
