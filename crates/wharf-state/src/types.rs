use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::LockError;
use crate::traits::LockOps;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message leased from a queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// Number of times the backend has handed this message out.
    pub attempt: u32,
    pub enqueued_at: SystemTime,
}

impl Message {
    /// Time spent in the queue so far. Clock skew reads as zero.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.enqueued_at)
            .unwrap_or_default()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// Holds a lock until released or dropped.
///
/// Dropping an unreleased guard schedules the release on the runtime, so a
/// guard must not outlive the tokio runtime that created it.
pub struct LockGuard {
    resource: String,
    token: String,
    ops: Arc<dyn LockOps>,
    released: AtomicBool,
}

impl LockGuard {
    pub fn new(resource: String, token: String, ops: Arc<dyn LockOps>) -> Self {
        Self {
            resource,
            token,
            ops,
            released: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LockError::NotHeld);
        }
        self.ops.refresh(&self.resource, &self.token, ttl).await
    }

    pub async fn release(self) -> Result<(), LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ops.release(&self.resource, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let ops = Arc::clone(&self.ops);
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = ops.release(&resource, &token).await {
                    tracing::warn!(resource = %resource, error = %e, "failed to release lock on drop");
                }
            });
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
