//! A Tokio-based bounded worker pool with per-task deadlines, plus a
//! supervisor for streaming consumers that fetch, handle with retry and
//! commit messages from pluggable sources.

mod config;
mod consumer;
mod consumer_manager;
mod error;
mod metrics;
mod pool;
mod retry;
mod source;
mod task;
mod task_queue;

pub use config::{BrokerConfig, CommitPolicy, ConsumerSettings, PoolConfig};
pub use consumer::Consumer;
pub use consumer_manager::{ConsumerManager, ManagerState};
pub use error::{BoxError, CommitError, ConsumerError, FetchError, HandlerError, PoolError, TaskFailure};
pub use metrics::{ConsumerStats, PoolStats};
pub use pool::{ShutdownMode, WorkerPool};
pub use retry::RetryPolicy;
pub use source::{
  async_handler_fn, handler_fn, AsyncFnHandler, ChannelConnector, ChannelSource, FnHandler, Message, MessageHandler,
  MessageSource, SourceConnector, Subscription,
};
pub use task::{Task, TaskContext};
