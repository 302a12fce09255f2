use std::time::Duration;
use taskfleet::{
  async_handler_fn, handler_fn, BoxError, BrokerConfig, ChannelConnector, ConsumerManager, ConsumerSettings, Message, RetryPolicy,
};
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Multi-Topic Consumer Example (Ctrl-C to stop) ---");

  let connector = ChannelConnector::new();
  let settings = ConsumerSettings {
    handler_retry: RetryPolicy::new(3, Duration::from_millis(200)),
    ..ConsumerSettings::default()
  };
  let manager = ConsumerManager::new(connector.clone()).with_settings(settings);
  let config = BrokerConfig::default();

  manager
    .add_consumer(
      &config,
      "user-events",
      "group_01",
      2,
      handler_fn(|message: &Message| {
        let user = message.key.as_deref().map(String::from_utf8_lossy).unwrap_or_default();
        info!(offset = message.offset, %user, "user event: {}", message.payload_str().unwrap_or("<binary>"));
        Ok(())
      }),
    )
    .expect("register user-events");

  manager
    .add_consumer(
      &config,
      "order-events",
      "group_02",
      1,
      async_handler_fn(|message: Message| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome: Result<(), BoxError> = if message.offset % 4 == 3 {
          Err(format!("order {} failed validation", message.offset).into())
        } else {
          info!(offset = message.offset, "order processed");
          Ok(())
        };
        outcome
      }),
    )
    .expect("register order-events");

  // Feed both topics until the manager shuts down.
  let token = manager.cancellation_token();
  let feeder_connector = connector.clone();
  tokio::spawn(async move {
    let mut n = 0u64;
    while !token.is_cancelled() {
      feeder_connector.source("user-events").publish_keyed(format!("user-{n}"), "login");
      feeder_connector.source("order-events").publish(format!("order #{n}"));
      n += 1;
      tokio::time::sleep(Duration::from_millis(500)).await;
    }
  });

  if let Err(e) = manager.start().await {
    tracing::error!("Manager failed to start: {}", e);
    return;
  }

  for (subscription, stats) in manager.stats() {
    info!(topic = %subscription.topic, group = %subscription.group, "final stats: {:?}", stats);
  }
  info!("--- Multi-Topic Consumer Example End ---");
}
