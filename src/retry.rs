use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-count retry with linear backoff (`backoff_base * attempt`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts including the first one. Zero is treated as one.
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  /// Upper bound for a single attempt, if any.
  pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::handler_default()
  }
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
    Self {
      max_attempts,
      backoff_base_ms: u64::try_from(backoff_base.as_millis()).unwrap_or(u64::MAX),
      attempt_timeout_ms: None,
    }
  }

  pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
    self.attempt_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
    self
  }

  /// 3 attempts, 1s base backoff, 30s per attempt.
  pub fn handler_default() -> Self {
    Self::new(3, Duration::from_secs(1)).with_attempt_timeout(Duration::from_secs(30))
  }

  /// 3 attempts, 1s base backoff, 5s per attempt.
  pub fn commit_default() -> Self {
    Self::new(3, Duration::from_secs(1)).with_attempt_timeout(Duration::from_secs(5))
  }

  pub fn attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }

  /// Delay after the given failed attempt (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    Duration::from_millis(self.backoff_base_ms).saturating_mul(attempt)
  }

  pub fn attempt_timeout(&self) -> Option<Duration> {
    self.attempt_timeout_ms.map(Duration::from_millis)
  }
}

#[derive(Debug)]
pub(crate) enum RetryOutcome<E> {
  Succeeded { attempts: u32 },
  Exhausted { error: E, attempts: u32 },
  /// Cancellation fired between attempts; no further attempt was made.
  Cancelled { error: E, attempts: u32 },
}

/// Runs `attempt` until it succeeds or the policy is exhausted.
///
/// `on_failed(attempt, max_attempts, &error)` is called after each failed
/// attempt. Backoff sleeps are interrupted by `token`; the attempts
/// themselves are not.
pub(crate) async fn run_with_retry<T, E, F, Fut>(
  policy: &RetryPolicy,
  token: &CancellationToken,
  mut attempt: F,
  mut on_failed: impl FnMut(u32, u32, &E),
) -> RetryOutcome<E>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let max_attempts = policy.attempts();
  let mut current = 1;
  loop {
    match attempt(current).await {
      Ok(_) => return RetryOutcome::Succeeded { attempts: current },
      Err(error) => {
        on_failed(current, max_attempts, &error);
        if current >= max_attempts {
          return RetryOutcome::Exhausted {
            error,
            attempts: current,
          };
        }
        if token.is_cancelled() {
          return RetryOutcome::Cancelled {
            error,
            attempts: current,
          };
        }
        let interrupted = tokio::select! {
          biased;
          _ = token.cancelled() => true,
          _ = tokio::time::sleep(policy.backoff(current)) => false,
        };
        if interrupted {
          return RetryOutcome::Cancelled {
            error,
            attempts: current,
          };
        }
        current += 1;
      }
    }
  }
}
