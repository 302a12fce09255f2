//! Configuration structs consumed by the pool and the consumers.
//!
//! Loading (TOML, JSON, environment) is left to the embedding application;
//! every struct derives `Deserialize` with field defaults so any serde format
//! can populate it.

use crate::error::{ConsumerError, PoolError};
use crate::retry::RetryPolicy;

use serde::Deserialize;
use std::time::Duration;

/// Settings for a `WorkerPool`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
  pub name: String,
  /// Number of worker slots.
  pub pool_size: usize,
  /// Capacity of the admission queue.
  pub queue_capacity: usize,
  pub default_task_timeout_ms: u64,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "worker_pool".to_string(),
      pool_size: 4,
      queue_capacity: 64,
      default_task_timeout_ms: 1_000,
    }
  }
}

impl PoolConfig {
  pub fn new(name: &str, pool_size: usize, queue_capacity: usize, default_task_timeout: Duration) -> Self {
    Self {
      name: name.to_string(),
      pool_size,
      queue_capacity,
      default_task_timeout_ms: u64::try_from(default_task_timeout.as_millis()).unwrap_or(u64::MAX),
    }
  }

  pub fn default_task_timeout(&self) -> Duration {
    Duration::from_millis(self.default_task_timeout_ms)
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    if self.pool_size == 0 {
      return Err(PoolError::InvalidConfig("pool_size must be positive".to_string()));
    }
    if self.queue_capacity == 0 {
      return Err(PoolError::InvalidConfig("queue_capacity must be positive".to_string()));
    }
    Ok(())
  }
}

/// Broker connection settings handed through to a `SourceConnector`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  pub brokers: Vec<String>,
  pub username: Option<String>,
  pub password: Option<String>,
  pub server_name: Option<String>,
  pub partition: i32,
  pub replication: i16,
  /// Default consumer group.
  pub group: String,
  pub auto_create_topic: bool,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      brokers: vec!["localhost:9092".to_string()],
      username: None,
      password: None,
      server_name: None,
      partition: 1,
      replication: 1,
      group: "group_01".to_string(),
      auto_create_topic: false,
    }
  }
}

impl BrokerConfig {
  /// SASL credentials are only used when a username is present.
  pub fn has_credentials(&self) -> bool {
    self.username.as_deref().is_some_and(|u| !u.is_empty())
  }

  pub fn validate(&self) -> Result<(), ConsumerError> {
    if self.brokers.iter().all(|b| b.trim().is_empty()) {
      return Err(ConsumerError::NoBrokers);
    }
    Ok(())
  }
}

/// What to do with a message whose handler exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
  /// Commit after every handled message, successful or not. Keeps the
  /// subscription moving; a message whose handler gave up is lost.
  #[default]
  Always,
  /// Commit only messages whose handler succeeded. A message whose handler
  /// gave up is left uncommitted and will be redelivered after a restart or
  /// rebalance.
  OnSuccess,
}

/// Consumer-level behavior shared by every fetch loop of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
  pub handler_retry: RetryPolicy,
  pub commit_retry: RetryPolicy,
  pub commit_policy: CommitPolicy,
  /// Pause after a non-transient fetch error before fetching again.
  pub fetch_error_backoff_ms: u64,
}

impl Default for ConsumerSettings {
  fn default() -> Self {
    Self {
      handler_retry: RetryPolicy::handler_default(),
      commit_retry: RetryPolicy::commit_default(),
      commit_policy: CommitPolicy::Always,
      fetch_error_backoff_ms: 0,
    }
  }
}

/// Bound on one commit attempt when `commit_retry` sets no attempt timeout.
pub const DEFAULT_COMMIT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

impl ConsumerSettings {
  pub fn fetch_error_backoff(&self) -> Duration {
    Duration::from_millis(self.fetch_error_backoff_ms)
  }

  /// A commit attempt is always bounded: an unresponsive source must not pin
  /// a fetch loop past shutdown.
  pub fn commit_attempt_timeout(&self) -> Duration {
    self.commit_retry.attempt_timeout().unwrap_or(DEFAULT_COMMIT_ATTEMPT_TIMEOUT)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pool_config_rejects_zero_sizes() {
    let mut config = PoolConfig::new("p", 0, 4, Duration::from_secs(1));
    assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    config.pool_size = 2;
    config.queue_capacity = 0;
    assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));
    config.queue_capacity = 1;
    assert_eq!(config.validate(), Ok(()));
    assert_eq!(config.default_task_timeout(), Duration::from_secs(1));
  }

  #[test]
  fn broker_config_defaults_and_validation() {
    let config = BrokerConfig::default();
    assert_eq!(config.brokers, vec!["localhost:9092".to_string()]);
    assert_eq!(config.group, "group_01");
    assert!(!config.has_credentials());
    assert_eq!(config.validate(), Ok(()));

    let empty = BrokerConfig {
      brokers: vec![" ".to_string()],
      ..BrokerConfig::default()
    };
    assert_eq!(empty.validate(), Err(ConsumerError::NoBrokers));
  }

  #[test]
  fn consumer_settings_default_to_always_commit() {
    let settings = ConsumerSettings::default();
    assert_eq!(settings.commit_policy, CommitPolicy::Always);
    assert_eq!(settings.handler_retry.max_attempts, 3);
    assert_eq!(settings.commit_retry.attempt_timeout(), Some(Duration::from_secs(5)));
    assert_eq!(settings.fetch_error_backoff(), Duration::ZERO);
  }

  #[test]
  fn commit_attempt_timeout_falls_back_when_unset() {
    let mut settings = ConsumerSettings::default();
    settings.commit_retry.attempt_timeout_ms = Some(250);
    assert_eq!(settings.commit_attempt_timeout(), Duration::from_millis(250));

    settings.commit_retry.attempt_timeout_ms = None;
    assert_eq!(settings.commit_attempt_timeout(), DEFAULT_COMMIT_ATTEMPT_TIMEOUT);
  }
}
