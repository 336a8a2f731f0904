//! Queue, lock and job-broker primitives shared by wharf workers.

mod broker;
mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use broker::{
    BrokerConfig, Delivery, HandlerError, JobBroker, JobHandler, Outcome, QueueSpec,
    DEFAULT_MAX_RETRIES, RETRY_COUNT_HEADER,
};
pub use error::{LockError, QueueError, StateError};
pub use traits::{LockBackend, LockOps, QueueBackend};
pub use types::{LockGuard, Message, MessageId};

#[cfg(feature = "memory")]
pub use memory::{MemoryLockProvider, MemoryQueue};

#[cfg(feature = "postgres")]
pub use postgres::PostgresQueue;

#[cfg(feature = "config")]
pub use config::{LockConfig, QueueConfig, StateConfig};

#[cfg(feature = "config")]
pub use provider::StateProvider;
