use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LockError, QueueError};
use crate::types::{LockGuard, Message, MessageId};

/// A durable, at-least-once message queue.
///
/// A received message stays invisible for `visibility_timeout` and becomes
/// deliverable again unless it is acked first. A consumer that dies mid-job
/// therefore gets its message redelivered once the lease lapses.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError>;

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError>;

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError>;

    /// Push a leased message's redelivery time `visibility_timeout` past now.
    ///
    /// Fails with `MessageNotFound` if the message has already been acked.
    async fn extend(
        &self,
        queue: &str,
        message_id: &MessageId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Number of messages held by the queue, in flight or not.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError>;

    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;
}

#[async_trait]
pub trait LockOps: Send + Sync {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError>;

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError>;
}
