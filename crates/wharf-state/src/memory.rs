use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{LockError, QueueError};
use crate::traits::{LockBackend, LockOps, QueueBackend};
use crate::types::{LockGuard, Message, MessageId};

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Message,
    visible_at: Instant,
}

/// Process-local queue backend. Messages do not survive a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads currently held by `queue`, oldest first.
    pub async fn snapshot(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.iter().map(|e| e.message.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        let mut queues = self.queues.lock().await;
        let id = MessageId::new(Uuid::new_v4().to_string());

        queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(QueueEntry {
                message: Message {
                    id: id.clone(),
                    payload: message.to_vec(),
                    attempt: 0,
                    enqueued_at: SystemTime::now(),
                },
                visible_at: Instant::now(),
            });

        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        let leased = entries.iter_mut().find(|e| e.visible_at <= now).map(|e| {
            e.visible_at = now + visibility_timeout;
            e.message.attempt += 1;
            e.message.clone()
        });

        Ok(leased)
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_owned()))?;

        let position = entries
            .iter()
            .position(|e| e.message.id == *message_id)
            .ok_or_else(|| QueueError::MessageNotFound(message_id.to_string()))?;
        entries.remove(position);

        Ok(())
    }

    async fn extend(
        &self,
        queue: &str,
        message_id: &MessageId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_owned()))?;

        let entry = entries
            .iter_mut()
            .find(|e| e.message.id == *message_id)
            .ok_or_else(|| QueueError::MessageNotFound(message_id.to_string()))?;
        entry.visible_at = Instant::now() + visibility_timeout;

        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: Mutex<HashMap<String, LockEntry>>,
}

#[async_trait]
impl LockOps for LockTable {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource) {
            Some(entry) if entry.token == token => {
                locks.remove(resource);
                Ok(())
            }
            Some(_) => Err(LockError::NotHeld),
            None => Ok(()),
        }
    }

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(resource) {
            Some(entry) if entry.token == token => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }
}

/// Process-local lock backend with expiring leases.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    table: Arc<LockTable>,
    poll_interval: Duration,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self {
            table: Arc::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLockProvider {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        loop {
            if let Some(guard) = self.try_acquire(resource, ttl).await? {
                return Ok(guard);
            }
            tokio::time::sleep(self.poll_interval.max(Duration::from_millis(1))).await;
        }
    }

    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut locks = self.table.locks.lock().await;
        let now = Instant::now();

        if locks.get(resource).is_some_and(|e| e.expires_at > now) {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(
            resource.to_owned(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        drop(locks);

        let ops: Arc<dyn LockOps> = self.table.clone();
        Ok(Some(LockGuard::new(resource.to_owned(), token, ops)))
    }
}
