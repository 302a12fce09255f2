//! The messaging capability consumed by `Consumer`, plus an in-memory
//! implementation.
//!
//! The crate never talks to a broker itself. A `SourceConnector` opens a
//! `MessageSource` per subscription; the source yields one message per
//! `fetch` and persists progress through `commit`.

use crate::config::BrokerConfig;
use crate::error::{BoxError, CommitError, ConsumerError, FetchError};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A single consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  pub topic: String,
  pub partition: i32,
  pub offset: i64,
  pub key: Option<Vec<u8>>,
  pub payload: Vec<u8>,
}

impl Message {
  pub fn new(topic: &str, partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
    Self {
      topic: topic.to_string(),
      partition,
      offset,
      key: None,
      payload: payload.into(),
    }
  }

  pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
    self.key = Some(key.into());
    self
  }

  pub fn payload_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.payload).ok()
  }
}

/// A topic/group pair and how many fetch loops should serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
  pub topic: String,
  pub group: String,
  pub concurrency: usize,
}

impl Subscription {
  /// A concurrency of zero is raised to one.
  pub fn new(topic: &str, group: &str, concurrency: usize) -> Self {
    Self {
      topic: topic.to_string(),
      group: group.to_string(),
      concurrency: concurrency.max(1),
    }
  }

  pub fn validate(&self) -> Result<(), ConsumerError> {
    if self.topic.trim().is_empty() {
      return Err(ConsumerError::EmptyTopic);
    }
    if self.group.trim().is_empty() {
      return Err(ConsumerError::EmptyGroup);
    }
    Ok(())
  }
}

/// Fetch/commit capability of an external messaging client.
pub trait MessageSource: Send + Sync {
  /// Waits for the next message. Must return `FetchError::Cancelled` promptly
  /// once `token` is cancelled.
  fn fetch<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<Message, FetchError>>;

  /// Marks `message` as processed for the subscription's group.
  fn commit<'a>(&'a self, token: &'a CancellationToken, message: &'a Message) -> BoxFuture<'a, Result<(), CommitError>>;
}

/// Opens message sources. The manager calls this once per registered subscription.
pub trait SourceConnector: Send + Sync {
  fn open(&self, config: &BrokerConfig, subscription: &Subscription) -> Result<Arc<dyn MessageSource>, ConsumerError>;
}

/// Processes one message. Errors are retried according to the consumer's
/// handler retry policy.
pub trait MessageHandler: Send + Sync {
  fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), BoxError>>;
}

/// Adapter for synchronous closures; see `handler_fn`.
pub struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
  F: Fn(&Message) -> Result<(), BoxError> + Send + Sync,
{
  fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), BoxError>> {
    Box::pin(async move { (self.0)(message) })
  }
}

/// Adapter for closures returning a future; see `async_handler_fn`.
pub struct AsyncFnHandler<F>(F);

impl<F, Fut> MessageHandler for AsyncFnHandler<F>
where
  F: Fn(Message) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
  fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), BoxError>> {
    Box::pin((self.0)(message.clone()))
  }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
  F: Fn(&Message) -> Result<(), BoxError> + Send + Sync + 'static,
{
  Arc::new(FnHandler(f))
}

/// The closure receives an owned copy of each message.
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
  F: Fn(Message) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
  Arc::new(AsyncFnHandler(f))
}

/// In-memory source for one topic, backed by an unbounded `async_channel`.
///
/// Every fetch loop of a consumer shares the same channel, so each published
/// message is delivered to exactly one loop. Commits are recorded in order.
#[derive(Debug)]
pub struct ChannelSource {
  topic: String,
  tx: async_channel::Sender<Message>,
  rx: async_channel::Receiver<Message>,
  next_offset: AtomicI64,
  committed: Mutex<Vec<Message>>,
}

impl ChannelSource {
  pub fn new(topic: &str) -> Arc<Self> {
    let (tx, rx) = async_channel::unbounded();
    Arc::new(Self {
      topic: topic.to_string(),
      tx,
      rx,
      next_offset: AtomicI64::new(0),
      committed: Mutex::new(Vec::new()),
    })
  }

  pub fn topic(&self) -> &str {
    &self.topic
  }

  /// Appends a payload and returns its offset, or `None` once the source is closed.
  pub fn publish(&self, payload: impl Into<Vec<u8>>) -> Option<i64> {
    let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
    self.send(Message::new(&self.topic, 0, offset, payload))
  }

  /// Like `publish`, with a message key.
  pub fn publish_keyed(&self, key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Option<i64> {
    let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
    self.send(Message::new(&self.topic, 0, offset, payload).with_key(key))
  }

  fn send(&self, message: Message) -> Option<i64> {
    let offset = message.offset;
    self.tx.try_send(message).ok().map(|()| offset)
  }

  /// Stops accepting new messages. Fetches drain what is left, then wait for cancellation.
  pub fn close(&self) {
    self.tx.close();
  }

  pub fn pending(&self) -> usize {
    self.rx.len()
  }

  pub fn committed(&self) -> Vec<Message> {
    self.committed.lock().clone()
  }

  pub fn committed_offsets(&self) -> Vec<i64> {
    self.committed.lock().iter().map(|m| m.offset).collect()
  }
}

impl MessageSource for ChannelSource {
  fn fetch<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<Message, FetchError>> {
    Box::pin(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        received = self.rx.recv() => match received {
          Ok(message) => Ok(message),
          Err(_) => {
            // Closed and drained: behave like an idle subscription.
            token.cancelled().await;
            Err(FetchError::Cancelled)
          }
        },
      }
    })
  }

  fn commit<'a>(&'a self, _token: &'a CancellationToken, message: &'a Message) -> BoxFuture<'a, Result<(), CommitError>> {
    Box::pin(async move {
      debug!(topic = %message.topic, offset = message.offset, "ChannelSource: committing offset.");
      self.committed.lock().push(message.clone());
      Ok(())
    })
  }
}

/// Connector handing out one shared `ChannelSource` per topic.
#[derive(Debug, Default)]
pub struct ChannelConnector {
  sources: DashMap<String, Arc<ChannelSource>>,
}

impl ChannelConnector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Returns the source for `topic`, creating it if needed.
  pub fn source(&self, topic: &str) -> Arc<ChannelSource> {
    self
      .sources
      .entry(topic.to_string())
      .or_insert_with(|| ChannelSource::new(topic))
      .clone()
  }
}

impl SourceConnector for ChannelConnector {
  fn open(&self, config: &BrokerConfig, subscription: &Subscription) -> Result<Arc<dyn MessageSource>, ConsumerError> {
    config.validate()?;
    subscription.validate()?;
    Ok(self.source(&subscription.topic))
  }
}
