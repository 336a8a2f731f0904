//! Job handlers for the three queues.
//!
//! Each handler turns a [`Job`] into a call on the pipeline or the lifecycle
//! controller and reports the result to the broker as a [`HandlerError`].
//! Retry counting and dead-lettering are the broker's business.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use wharf_state::{Delivery, HandlerError, JobHandler};

use crate::error::ControlError;
use crate::events::EventNotifier;
use crate::jobs::{Job, JobKind, QueueKind};
use crate::lifecycle::LifecycleController;
use crate::pipeline::{PipelineExecutor, PipelineOutcome};
use crate::store::DeploymentStore;

/// A job that arrived on a queue it does not belong to can never succeed.
fn misrouted(job: &Job, expected: QueueKind) -> HandlerError {
    HandlerError::Fatal(format!(
        "job {} of type {} does not belong on the {expected:?} queue",
        job.job_id,
        job.kind.as_str()
    ))
}

fn report(job: &Job, delivery: &Delivery, err: ControlError) -> HandlerError {
    error!(
        job_id = %job.job_id,
        job_type = job.kind.as_str(),
        deployment_id = %job.deployment_id,
        retry_count = delivery.retry_count,
        retryable = err.is_retryable(),
        error = %err,
        "job failed"
    );
    err.into()
}

/// Handles `deployment:create`, `deployment:redeploy` and
/// `deployment:rollback` by running the pipeline.
pub struct DeploymentJobHandler {
    pipeline: Arc<PipelineExecutor>,
}

impl DeploymentJobHandler {
    pub fn new(pipeline: Arc<PipelineExecutor>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for DeploymentJobHandler {
    type Job = Job;

    async fn handle(&self, job: Job, delivery: &Delivery) -> Result<(), HandlerError> {
        if job.queue() != QueueKind::Deployment {
            return Err(misrouted(&job, QueueKind::Deployment));
        }

        info!(
            job_id = %job.job_id,
            job_type = job.kind.as_str(),
            deployment_id = %job.deployment_id,
            retry_count = delivery.retry_count,
            "deployment job received"
        );

        match self.pipeline.run(&job.deployment_id).await {
            Ok(
                PipelineOutcome::Deployed(_)
                | PipelineOutcome::Skipped(_)
                | PipelineOutcome::InProgress,
            ) => Ok(()),
            Err(e) => Err(report(&job, delivery, e)),
        }
    }
}

/// Handles `container:start`, `container:stop` and `container:delete`.
pub struct ContainerJobHandler {
    lifecycle: Arc<LifecycleController>,
    store: Arc<dyn DeploymentStore>,
    notifier: EventNotifier,
}

impl ContainerJobHandler {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        store: Arc<dyn DeploymentStore>,
        notifier: EventNotifier,
    ) -> Self {
        Self {
            lifecycle,
            store,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler for ContainerJobHandler {
    type Job = Job;

    async fn handle(&self, job: Job, delivery: &Delivery) -> Result<(), HandlerError> {
        let Some(operation) = job.kind.container_operation() else {
            return Err(misrouted(&job, QueueKind::Container));
        };

        info!(
            job_id = %job.job_id,
            operation = %operation,
            deployment_id = %job.deployment_id,
            retry_count = delivery.retry_count,
            "container job received"
        );

        let exists = match self.store.get(&job.deployment_id).await {
            Ok(record) => record.is_some(),
            Err(e) => return Err(report(&job, delivery, e)),
        };
        if !exists {
            let err = ControlError::deployment_not_found(&job.deployment_id);
            self.notifier.container_operation(
                &job.deployment_id,
                operation,
                Err(err.to_string()),
            );
            return Err(report(&job, delivery, err));
        }

        match self
            .lifecycle
            .apply_operation(&job.deployment_id, operation)
            .await
        {
            Ok(()) => {
                self.notifier
                    .container_operation(&job.deployment_id, operation, Ok(()));
                Ok(())
            }
            Err(e) => {
                self.notifier
                    .container_operation(&job.deployment_id, operation, Err(e.to_string()));
                Err(report(&job, delivery, e))
            }
        }
    }
}

/// Handles `source:push` by replacing a running deployment with a build of
/// its branch head.
pub struct SourcePushHandler {
    lifecycle: Arc<LifecycleController>,
}

impl SourcePushHandler {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for SourcePushHandler {
    type Job = Job;

    async fn handle(&self, job: Job, delivery: &Delivery) -> Result<(), HandlerError> {
        let JobKind::SourcePush {
            branch, commit_sha, ..
        } = &job.kind
        else {
            return Err(misrouted(&job, QueueKind::SourcePush));
        };

        info!(
            job_id = %job.job_id,
            deployment_id = %job.deployment_id,
            branch = %branch,
            commit = %commit_sha,
            retry_count = delivery.retry_count,
            "source push received"
        );

        match self.lifecycle.redeploy_from_push(&job.deployment_id).await {
            Ok(child) => {
                info!(
                    deployment_id = %job.deployment_id,
                    new_deployment_id = %child.id,
                    "push redeploy scheduled"
                );
                Ok(())
            }
            Err(e) => Err(report(&job, delivery, e)),
        }
    }
}

impl std::fmt::Debug for DeploymentJobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentJobHandler").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ContainerJobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerJobHandler").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SourcePushHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePushHandler").finish_non_exhaustive()
    }
}
