use crate::config::{BrokerConfig, ConsumerSettings};
use crate::consumer::Consumer;
use crate::error::ConsumerError;
use crate::metrics::ConsumerStats;
use crate::source::{MessageHandler, SourceConnector, Subscription};

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, info_span, warn, Dispatch, Instrument};

/// Lifecycle of a `ConsumerManager`. There is no way back to `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
  NotStarted,
  Started,
  Stopped,
}

struct Registry {
  state: ManagerState,
  consumers: Vec<Arc<Consumer>>,
}

/// Supervises a set of consumers sharing one cancellation scope.
///
/// Consumers are registered while the manager is `NotStarted` and all start
/// together. Stopping cancels the shared token and waits for every
/// consumer's fetch loops to exit.
pub struct ConsumerManager {
  connector: Arc<dyn SourceConnector>,
  settings: ConsumerSettings,
  token: CancellationToken,
  registry: Arc<Mutex<Registry>>,
  tokio_handle: TokioHandle,
  dispatch: Dispatch,
}

impl ConsumerManager {
  /// Must be called from within a Tokio runtime; consumers are spawned on it.
  pub fn new(connector: Arc<dyn SourceConnector>) -> Self {
    Self::with_handle(connector, TokioHandle::current())
  }

  pub fn with_handle(connector: Arc<dyn SourceConnector>, tokio_handle: TokioHandle) -> Self {
    Self {
      connector,
      settings: ConsumerSettings::default(),
      token: CancellationToken::new(),
      registry: Arc::new(Mutex::new(Registry {
        state: ManagerState::NotStarted,
        consumers: Vec::new(),
      })),
      tokio_handle,
      dispatch: tracing::dispatcher::get_default(Dispatch::clone),
    }
  }

  /// Settings applied to every consumer added afterwards.
  pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
    self.dispatch = dispatch;
    self
  }

  pub fn state(&self) -> ManagerState {
    self.registry.lock().state
  }

  /// True once `start` or `start_async` succeeded, including after stop.
  pub fn is_started(&self) -> bool {
    self.state() != ManagerState::NotStarted
  }

  pub fn consumer_count(&self) -> usize {
    self.registry.lock().consumers.len()
  }

  /// The shared scope. Cancelling it stops every consumer.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.token.clone()
  }

  /// Per-subscription counters, in registration order.
  pub fn stats(&self) -> Vec<(Subscription, ConsumerStats)> {
    self
      .registry
      .lock()
      .consumers
      .iter()
      .map(|consumer| (consumer.subscription().clone(), consumer.stats()))
      .collect()
  }

  /// Registers a subscription served by `concurrency` fetch loops. Only
  /// allowed before the manager starts.
  pub fn add_consumer(
    &self,
    config: &BrokerConfig,
    topic: &str,
    group: &str,
    concurrency: usize,
    handler: Arc<dyn MessageHandler>,
  ) -> Result<(), ConsumerError> {
    tracing::dispatcher::with_default(&self.dispatch, || {
      let mut registry = self.registry.lock();
      if registry.state != ManagerState::NotStarted {
        warn!(topic, group, "AddConsumer: Manager already started, consumer rejected.");
        return Err(ConsumerError::AlreadyStarted);
      }

      let subscription = Subscription::new(topic, group, concurrency);
      config.validate()?;
      subscription.validate()?;
      let source = self.connector.open(config, &subscription).map_err(|open_error| {
        error!(topic, group, "AddConsumer: Failed to open message source: {}", open_error);
        open_error
      })?;

      let consumer = Consumer::new(config, subscription, handler, source, self.settings.clone())?.with_dispatch(self.dispatch.clone());
      registry.consumers.push(Arc::new(consumer));
      info!(
        topic,
        group,
        concurrency = concurrency.max(1),
        registered = registry.consumers.len(),
        "Consumer registered."
      );
      Ok(())
    })
  }

  /// Starts every consumer, then waits for Ctrl-C, SIGTERM or cancellation of
  /// the shared token before stopping all of them.
  pub async fn start(&self) -> Result<(), ConsumerError> {
    self.start_with_signal(termination_signal()).await
  }

  /// Like `start`, with a caller-provided termination future.
  pub async fn start_with_signal<F>(&self, signal: F) -> Result<(), ConsumerError>
  where
    F: Future<Output = ()>,
  {
    let consumers = self.begin()?;
    self.launch(&consumers);

    async {
      info!(consumers = consumers.len(), "Consumer manager running. Waiting for termination signal.");
      tokio::select! {
        _ = signal => info!("Termination signal received."),
        _ = self.token.cancelled() => info!("Shared scope cancelled."),
      }
    }
    .with_subscriber(self.dispatch.clone())
    .await;

    self.stop_all().await;
    Ok(())
  }

  /// Starts every consumer without blocking. The returned receiver resolves
  /// once the shared token is cancelled and every consumer has stopped.
  pub fn start_async(&self) -> Result<oneshot::Receiver<()>, ConsumerError> {
    let consumers = self.begin()?;
    self.launch(&consumers);

    let (done_tx, done_rx) = oneshot::channel();
    let token = self.token.clone();
    let registry = self.registry.clone();
    let teardown = async move {
      token.cancelled().await;
      registry.lock().state = ManagerState::Stopped;
      drain(&consumers).await;
      info!("All consumers stopped.");
      let _ = done_tx.send(());
    }
    .instrument(info_span!("consumer_manager_teardown"))
    .with_subscriber(self.dispatch.clone());
    self.tokio_handle.spawn(teardown);

    Ok(done_rx)
  }

  /// Cancels the shared token and waits for every consumer to stop. A no-op
  /// when the manager never started; safe to call repeatedly.
  pub async fn stop_all(&self) {
    let consumers = {
      let mut registry = self.registry.lock();
      if registry.state == ManagerState::NotStarted {
        tracing::dispatcher::with_default(&self.dispatch, || {
          info!("StopAll: Manager not started, nothing to stop.");
        });
        return;
      }
      registry.state = ManagerState::Stopped;
      registry.consumers.clone()
    };

    async {
      info!(consumers = consumers.len(), "Stopping all consumers.");
      self.token.cancel();
      drain(&consumers).await;
      info!("All consumers stopped.");
    }
    .with_subscriber(self.dispatch.clone())
    .await;
  }

  /// NotStarted -> Started. Leaves the state untouched on error.
  fn begin(&self) -> Result<Vec<Arc<Consumer>>, ConsumerError> {
    tracing::dispatcher::with_default(&self.dispatch, || {
      let mut registry = self.registry.lock();
      if registry.state != ManagerState::NotStarted {
        warn!("Start: Manager already started.");
        return Err(ConsumerError::AlreadyStarted);
      }
      if registry.consumers.is_empty() {
        warn!("Start: No consumers registered.");
        return Err(ConsumerError::NoConsumers);
      }
      registry.state = ManagerState::Started;
      Ok(registry.consumers.clone())
    })
  }

  fn launch(&self, consumers: &[Arc<Consumer>]) {
    for consumer in consumers {
      consumer.start(&self.token, &self.tokio_handle);
    }
  }
}

async fn drain(consumers: &[Arc<Consumer>]) {
  let total = consumers.len();
  for (index, consumer) in consumers.iter().enumerate() {
    let subscription = consumer.subscription();
    info!(
      topic = %subscription.topic,
      group = %subscription.group,
      "Waiting for consumer {}/{} to stop.",
      index + 1,
      total
    );
    consumer.wait().await;
  }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn termination_signal() {
  let ctrl_c = async {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
      error!("Failed to listen for Ctrl-C: {}", signal_error);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(signal_error) => {
        error!("Failed to listen for SIGTERM: {}", signal_error);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => info!("Received Ctrl-C."),
    _ = terminate => info!("Received SIGTERM."),
  }
}
