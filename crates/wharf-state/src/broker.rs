//! Job broker built on a [`QueueBackend`].
//!
//! Every job travels in an envelope carrying an `x-retry-count` header that
//! starts at 0. Handler failures are settled according to [`Outcome`]:
//! retryable failures are republished with the counter incremented until it
//! reaches the configured maximum, after which the job is moved to the
//! queue's dead-letter queue. The original message is acked only once its
//! successor (if any) has been published, so a crash at any point leaves at
//! least one copy in the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::QueueError;
use crate::traits::QueueBackend;
use crate::types::{Message, MessageId};

/// Header name for the broker-managed retry counter.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A named queue with its dead-letter queue and optional message TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    dead_letter: String,
    ttl: Option<Duration>,
}

impl QueueSpec {
    /// A queue whose dead-letter queue is `<name>_dlq`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dead_letter: format!("{name}_dlq"),
            name,
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter(&self) -> &str {
        &self.dead_letter
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "x-retry-count", default)]
    retry_count: u32,
    job: serde_json::Value,
}

/// Delivery metadata handed to a [`JobHandler`] alongside the job.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub message_id: MessageId,
    pub retry_count: u32,
    /// Backend delivery count for this copy of the message.
    pub attempt: u32,
}

/// How a delivered message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    RetryWithCount(u32),
    DeadLetter,
}

impl Outcome {
    /// Settlement for a handler result at the given retry count.
    pub fn decide(result: &Result<(), HandlerError>, retry_count: u32, max_retries: u32) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(HandlerError::Fatal(_)) => Self::DeadLetter,
            Err(HandlerError::Retryable(_)) if retry_count < max_retries => {
                Self::RetryWithCount(retry_count + 1)
            }
            Err(HandlerError::Retryable(_)) => Self::DeadLetter,
        }
    }
}

/// Failure reported by a [`JobHandler`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the job is retried while the budget lasts.
    #[error("{0}")]
    Retryable(String),

    /// The job can never succeed; it goes straight to the dead-letter queue.
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Job: DeserializeOwned + Send + 'static;

    async fn handle(&self, job: Self::Job, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_retries: u32,
    /// Lease on a received message, renewed while its handler runs.
    pub visibility_timeout: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            visibility_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct JobBroker {
    backend: Arc<dyn QueueBackend>,
    config: BrokerConfig,
}

impl JobBroker {
    pub fn new(backend: Arc<dyn QueueBackend>, config: BrokerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Publish a job with a fresh retry counter.
    ///
    /// Returns once the backend has persisted the message.
    pub async fn publish<T>(&self, queue: &QueueSpec, job: &T) -> Result<MessageId, QueueError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let envelope = Envelope {
            retry_count: 0,
            job: serde_json::to_value(job)?,
        };
        let id = self.send(queue.name(), &envelope).await?;
        debug!(queue = %queue.name(), message_id = %id, "job published");
        Ok(id)
    }

    /// Messages waiting in the queue's dead-letter queue.
    pub async fn dead_letter_depth(&self, queue: &QueueSpec) -> Result<usize, QueueError> {
        self.backend.depth(queue.dead_letter()).await
    }

    pub async fn depth(&self, queue: &QueueSpec) -> Result<usize, QueueError> {
        self.backend.depth(queue.name()).await
    }

    /// Receive and settle a single message, if one is visible.
    pub async fn process_next<H>(
        &self,
        queue: &QueueSpec,
        handler: &H,
    ) -> Result<Option<Outcome>, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let Some(message) = self
            .backend
            .receive(queue.name(), self.config.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };

        self.handle_message(queue, message, handler).await.map(Some)
    }

    /// Consume `queue` until `cancel` fires, running at most `prefetch`
    /// handlers at once.
    ///
    /// Cancellation stops new receives immediately; handlers already running
    /// are awaited.
    #[instrument(skip_all, fields(queue = %queue.name()))]
    pub async fn consume<H>(
        &self,
        queue: QueueSpec,
        handler: Arc<H>,
        prefetch: usize,
        cancel: CancellationToken,
    ) where
        H: JobHandler,
    {
        let prefetch = prefetch.max(1);
        let permits = Arc::new(Semaphore::new(prefetch));
        let mut in_flight = JoinSet::new();

        info!(prefetch, "consumer started");

        loop {
            let permit = tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = in_flight.try_join_next() {
                log_join_result(joined);
            }

            let received = self
                .backend
                .receive(queue.name(), self.config.visibility_timeout)
                .await;

            match received {
                Ok(Some(message)) => {
                    let broker = self.clone();
                    let queue = queue.clone();
                    let handler = Arc::clone(&handler);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        broker
                            .handle_message(&queue, message, handler.as_ref())
                            .await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if idle(&cancel, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "receive failed");
                    if idle(&cancel, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "consumer stopping");
        while let Some(joined) = in_flight.join_next().await {
            log_join_result(joined);
        }
        info!("consumer stopped");
    }

    async fn send(&self, queue: &str, envelope: &Envelope) -> Result<MessageId, QueueError> {
        let payload = serde_json::to_vec(envelope)?;
        self.backend.publish(queue, &payload).await
    }

    async fn handle_message<H>(
        &self,
        queue: &QueueSpec,
        message: Message,
        handler: &H,
    ) -> Result<Outcome, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let envelope: Envelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    queue = %queue.name(),
                    message_id = %message.id,
                    error = %e,
                    "undecodable message, moving to dead-letter queue"
                );
                self.backend
                    .publish(queue.dead_letter(), &message.payload)
                    .await?;
                self.backend.ack(queue.name(), &message.id).await?;
                return Ok(Outcome::DeadLetter);
            }
        };

        if let Some(ttl) = queue.ttl() {
            if message.is_expired(ttl) {
                warn!(
                    queue = %queue.name(),
                    message_id = %message.id,
                    ttl_secs = ttl.as_secs(),
                    "message expired, moving to dead-letter queue"
                );
                self.send(queue.dead_letter(), &envelope).await?;
                self.backend.ack(queue.name(), &message.id).await?;
                return Ok(Outcome::DeadLetter);
            }
        }

        let delivery = Delivery {
            queue: queue.name().to_owned(),
            message_id: message.id.clone(),
            retry_count: envelope.retry_count,
            attempt: message.attempt,
        };

        let result = match serde_json::from_value::<H::Job>(envelope.job.clone()) {
            Ok(job) => {
                self.with_lease(queue, &message.id, handler.handle(job, &delivery))
                    .await
            }
            Err(e) => Err(HandlerError::Fatal(format!("malformed job payload: {e}"))),
        };

        if let Err(e) = &result {
            error!(
                queue = %queue.name(),
                message_id = %message.id,
                retry_count = envelope.retry_count,
                error = %e,
                "job handler failed"
            );
        }

        let outcome = Outcome::decide(&result, envelope.retry_count, self.config.max_retries);
        match outcome {
            Outcome::Ack => {}
            Outcome::RetryWithCount(retry_count) => {
                info!(
                    queue = %queue.name(),
                    retry_count,
                    max_retries = self.config.max_retries,
                    "requeueing job"
                );
                let retry = Envelope {
                    retry_count,
                    job: envelope.job,
                };
                self.send(queue.name(), &retry).await?;
            }
            Outcome::DeadLetter => {
                error!(
                    queue = %queue.name(),
                    dead_letter = %queue.dead_letter(),
                    retry_count = envelope.retry_count,
                    "job dead-lettered"
                );
                self.send(queue.dead_letter(), &envelope).await?;
            }
        }

        self.backend.ack(queue.name(), &message.id).await?;
        Ok(outcome)
    }
}

impl JobBroker {
    /// Drive `work` to completion, extending the message lease every third of
    /// the visibility timeout so a long handler is not redelivered elsewhere.
    async fn with_lease<F, T>(&self, queue: &QueueSpec, message_id: &MessageId, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lease = self.config.visibility_timeout;
        let period = (lease / 3).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick() => {
                    match self.backend.extend(queue.name(), message_id, lease).await {
                        Ok(()) => debug!(
                            queue = %queue.name(),
                            message_id = %message_id,
                            "message lease extended"
                        ),
                        Err(e) => warn!(
                            queue = %queue.name(),
                            message_id = %message_id,
                            error = %e,
                            "failed to extend message lease"
                        ),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for JobBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Sleep for `interval`; true if cancelled first.
async fn idle(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(interval) => false,
    }
}

fn log_join_result(joined: Result<Result<Outcome, QueueError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(outcome)) => debug!(?outcome, "job settled"),
        Ok(Err(e)) => error!(error = %e, "failed to settle job, it will be redelivered"),
        Err(e) => error!(error = %e, "job task panicked"),
    }
}
