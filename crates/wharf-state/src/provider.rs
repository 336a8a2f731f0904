use std::sync::Arc;

use crate::config::{LockConfig, QueueConfig, StateConfig};
use crate::error::StateError;
use crate::traits::{LockBackend, QueueBackend};

#[cfg(feature = "memory")]
use crate::memory::{MemoryLockProvider, MemoryQueue};

#[cfg(feature = "postgres")]
use crate::postgres::PostgresQueue;

/// Resolved queue and lock backends.
#[derive(Clone, Default)]
pub struct StateProvider {
    queue: Option<Arc<dyn QueueBackend>>,
    lock: Option<Arc<dyn LockBackend>>,
}

impl StateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        Ok(Self {
            queue: Some(Self::create_queue_backend(&config.queue).await?),
            lock: Some(Self::create_lock_backend(&config.lock)?),
        })
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn LockBackend>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn queue(&self) -> Result<Arc<dyn QueueBackend>, StateError> {
        self.queue
            .clone()
            .ok_or_else(|| StateError::NotConfigured("queue".to_owned()))
    }

    pub fn lock(&self) -> Result<Arc<dyn LockBackend>, StateError> {
        self.lock
            .clone()
            .ok_or_else(|| StateError::NotConfigured("lock".to_owned()))
    }

    async fn create_queue_backend(
        config: &QueueConfig,
    ) -> Result<Arc<dyn QueueBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            QueueConfig::Memory => Ok(Arc::new(MemoryQueue::new())),

            #[cfg(feature = "postgres")]
            QueueConfig::Postgres { url, table } => {
                let queue = PostgresQueue::new(url, table.clone())
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(queue))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "no suitable queue backend enabled".to_owned(),
            )),
        }
    }

    fn create_lock_backend(config: &LockConfig) -> Result<Arc<dyn LockBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            LockConfig::Memory => Ok(Arc::new(MemoryLockProvider::new())),

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "no suitable lock backend enabled".to_owned(),
            )),
        }
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("queue", &self.queue.is_some())
            .field("lock", &self.lock.is_some())
            .finish()
    }
}
