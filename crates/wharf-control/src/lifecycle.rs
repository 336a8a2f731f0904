//! Lifecycle operations on deployments.
//!
//! Operations that need a build (create, redeploy, rollback, push redeploy)
//! only prepare the ledger and enqueue a deployment job; they return as soon
//! as the job is persisted in the broker. Completion is observed through the
//! [`EventNotifier`]. Start, stop and delete act on the container runtime
//! directly and are used both synchronously and by the container-operation
//! worker.

use std::sync::Arc;

use tracing::{info, warn};
use wharf_build::source::validate_branch_name;
use wharf_build::{BuildLogStore, ContainerRuntime};
use wharf_state::JobBroker;

use crate::error::{ControlError, ControlResult};
use crate::events::EventNotifier;
use crate::history::{HistoryEntry, HistoryResolver};
use crate::jobs::{Job, JobKind, Queues};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{
    BuildSpecInput, ContainerOperation, ContainerStatus, CreateDeployment, DeletedDeployment,
    DeploymentDetails, DeploymentId, DeploymentRecord, DeploymentStatus, NewDeployment,
    RepositoryId, SourcePushTrigger, UNKNOWN_COMMIT,
};

/// Entry point for everything that changes a deployment's lifecycle.
pub struct LifecycleController {
    store: Arc<dyn DeploymentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    broker: JobBroker,
    queues: Queues,
    notifier: EventNotifier,
    history: HistoryResolver,
    logs: BuildLogStore,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        broker: JobBroker,
        queues: Queues,
        notifier: EventNotifier,
        logs: BuildLogStore,
    ) -> Self {
        Self {
            history: HistoryResolver::new(Arc::clone(&store)),
            store,
            runtime,
            broker,
            queues,
            notifier,
            logs,
        }
    }

    /// Validate a request, record a `PENDING` deployment and enqueue its build.
    ///
    /// Invalid specs and branch names fail before anything is written.
    pub async fn create(&self, request: CreateDeployment) -> ControlResult<DeploymentRecord> {
        validate_branch_name(&request.branch)?;
        let build_spec = request.build_spec.validate()?;

        let record = self
            .store
            .create_deployment(&NewDeployment {
                clone_url: request.repo_url,
                branch: request.branch,
                build_spec,
            })
            .await?;

        if let Err(e) = self.enqueue(&record.id, JobKind::DeploymentCreate).await {
            let message = format!("failed to enqueue build: {e}");
            if let Err(mark_err) = self.store.mark_failed(&record.id, &message).await {
                warn!(deployment_id = %record.id, error = %mark_err, "failed to mark deployment failed");
            }
            return Err(e);
        }

        info!(
            deployment_id = %record.id,
            branch = %record.branch,
            port = record.exposed_port,
            "deployment created"
        );
        Ok(record)
    }

    pub async fn details(&self, id: &DeploymentId) -> ControlResult<DeploymentDetails> {
        self.store
            .get_details(id)
            .await?
            .ok_or_else(|| ControlError::deployment_not_found(id))
    }

    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    pub async fn history(&self, id: &DeploymentId) -> ControlResult<Vec<HistoryEntry>> {
        self.history.history(id).await
    }

    /// Start a stopped container. Already running is a no-op.
    ///
    /// Fails with `Conflict` if another deployment now holds the port.
    pub async fn start(&self, id: &DeploymentId) -> ControlResult<DeploymentStatus> {
        let details = self.details(id).await?;

        match details.deployment.status {
            DeploymentStatus::Running => return Ok(DeploymentStatus::Running),
            DeploymentStatus::Stopped => {}
            other => {
                return Err(ControlError::InvalidStateTransition {
                    from: other.as_str(),
                    to: DeploymentStatus::Running.as_str(),
                })
            }
        }
        let container = details.container.ok_or_else(|| no_container(id))?;

        self.runtime.start(&container.container_id).await?;
        if let Err(e) = self
            .store
            .set_container_status(id, ContainerStatus::Running)
            .await
        {
            // Usually another deployment took the port while this one was stopped.
            if let Err(stop_err) = self.runtime.stop(&container.container_id).await {
                warn!(
                    deployment_id = %id,
                    container_id = %container.container_id,
                    error = %stop_err,
                    "failed to stop container after rejected start"
                );
            }
            return Err(e);
        }
        self.notifier.status(id, DeploymentStatus::Running, None);

        info!(deployment_id = %id, container_id = %container.container_id, "container started");
        Ok(DeploymentStatus::Running)
    }

    /// Stop a running container. Already stopped is a no-op.
    pub async fn stop(&self, id: &DeploymentId) -> ControlResult<DeploymentStatus> {
        let details = self.details(id).await?;

        match details.deployment.status {
            DeploymentStatus::Stopped => return Ok(DeploymentStatus::Stopped),
            DeploymentStatus::Running => {}
            other => {
                return Err(ControlError::InvalidStateTransition {
                    from: other.as_str(),
                    to: DeploymentStatus::Stopped.as_str(),
                })
            }
        }
        let container = details.container.ok_or_else(|| no_container(id))?;

        self.runtime.stop(&container.container_id).await?;
        self.store
            .set_container_status(id, ContainerStatus::Stopped)
            .await?;
        self.notifier.status(id, DeploymentStatus::Stopped, None);

        info!(deployment_id = %id, container_id = %container.container_id, "container stopped");
        Ok(DeploymentStatus::Stopped)
    }

    /// Delete a deployment from any state.
    ///
    /// The container and the log directory are removed best-effort before
    /// the ledger rows; the image goes too once no deployment of the
    /// repository still uses it.
    pub async fn delete(&self, id: &DeploymentId) -> ControlResult<DeletedDeployment> {
        let details = self.details(id).await?;

        if let Some(container) = &details.container {
            if let Err(e) = self.runtime.remove(&container.container_id).await {
                warn!(
                    deployment_id = %id,
                    container_id = %container.container_id,
                    error = %e,
                    "failed to remove container"
                );
            }
        }

        if let Err(e) = self.logs.remove(id.as_str()).await {
            warn!(deployment_id = %id, error = %e, "failed to remove deployment logs");
        }

        let deleted = self.store.delete_deployment(id).await?;

        if let Some(tag) = &deleted.deployment.image_tag {
            self.remove_image_if_unused(&deleted.deployment.repository_id, tag)
                .await;
        }

        info!(
            deployment_id = %id,
            repository_removed = deleted.repository_removed,
            "deployment deleted"
        );
        Ok(deleted)
    }

    /// Rebuild a deployment in place, optionally with a new build spec.
    ///
    /// The exposed port is not re-checked against other deployments.
    pub async fn redeploy(
        &self,
        id: &DeploymentId,
        build_spec: Option<BuildSpecInput>,
    ) -> ControlResult<DeploymentRecord> {
        let details = self.details(id).await?;
        let build_spec = build_spec.map(BuildSpecInput::validate).transpose()?;

        if let Some(container) = &details.container {
            if let Err(e) = self.runtime.remove(&container.container_id).await {
                warn!(
                    deployment_id = %id,
                    container_id = %container.container_id,
                    error = %e,
                    "failed to remove container before redeploy"
                );
            }
        }

        let record = self
            .store
            .reset_for_redeploy(id, build_spec.as_ref())
            .await?;
        self.notifier.status(id, DeploymentStatus::Pending, None);
        self.enqueue(id, JobKind::DeploymentRedeploy).await?;

        info!(deployment_id = %id, "redeploy queued");
        Ok(record)
    }

    /// Deploy a commit from this deployment's history as a new child.
    ///
    /// The child takes the build spec of the deployment that originally ran
    /// the commit. The current deployment is stopped first if it is running.
    pub async fn rollback(
        &self,
        id: &DeploymentId,
        commit_sha: &str,
    ) -> ControlResult<DeploymentRecord> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::deployment_not_found(id))?;
        // Unresolved builds carry the sentinel, which names no commit.
        if commit_sha == UNKNOWN_COMMIT {
            return Err(ControlError::not_found(format!(
                "Commit {commit_sha} not found in deployment history"
            )));
        }
        let target = self.history.find_by_commit(id, commit_sha).await?;

        if current.status == DeploymentStatus::Running {
            self.stop_best_effort(id).await;
        }

        let child = self
            .store
            .insert_child(id, &target.commit_sha, &target.build_spec)
            .await?;
        self.notifier.new_deployment(id, &child.id);
        self.enqueue(&child.id, JobKind::DeploymentRollback).await?;

        info!(
            deployment_id = %id,
            new_deployment_id = %child.id,
            commit = %commit_sha,
            "rollback queued"
        );
        Ok(child)
    }

    /// Replace `parent` with a child built from its branch head.
    ///
    /// A pending child left behind by an earlier attempt is reused, so a
    /// redelivered push job does not fork the chain.
    pub async fn redeploy_from_push(&self, parent: &DeploymentId) -> ControlResult<DeploymentRecord> {
        let record = self
            .store
            .get(parent)
            .await?
            .ok_or_else(|| ControlError::deployment_not_found(parent))?;

        if record.status == DeploymentStatus::Running {
            self.stop_best_effort(parent).await;
        }

        let pending = self
            .store
            .list(
                &DeploymentFilter::new()
                    .with_parent(parent.clone())
                    .with_status(DeploymentStatus::Pending)
                    .with_limit(1),
            )
            .await?;
        let child = match pending.into_iter().next() {
            Some(child) => child,
            None => {
                self.store
                    .insert_child(parent, UNKNOWN_COMMIT, &record.build_spec)
                    .await?
            }
        };

        self.notifier.new_deployment(parent, &child.id);
        self.enqueue(&child.id, JobKind::DeploymentRedeploy).await?;

        info!(deployment_id = %parent, new_deployment_id = %child.id, "push redeploy queued");
        Ok(child)
    }

    /// Fan a push out to one `source:push` job per running deployment of the
    /// pushed branch. Returns the number of jobs published.
    pub async fn handle_source_push(&self, trigger: &SourcePushTrigger) -> ControlResult<usize> {
        let targets = self
            .store
            .list(
                &DeploymentFilter::new()
                    .with_repository(trigger.repository_id.clone())
                    .with_branch(trigger.branch.clone())
                    .with_status(DeploymentStatus::Running),
            )
            .await?;

        for target in &targets {
            self.enqueue(
                &target.id,
                JobKind::SourcePush {
                    repository_id: trigger.repository_id.clone(),
                    branch: trigger.branch.clone(),
                    commit_sha: trigger.commit_sha.clone(),
                },
            )
            .await?;
        }

        info!(
            repository_id = %trigger.repository_id,
            branch = %trigger.branch,
            commit = %trigger.commit_sha,
            jobs = targets.len(),
            "source push fanned out"
        );
        Ok(targets.len())
    }

    /// Queue a container operation after checking it makes sense for the
    /// current status.
    pub async fn request_operation(
        &self,
        id: &DeploymentId,
        operation: ContainerOperation,
    ) -> ControlResult<Job> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::deployment_not_found(id))?;

        let expected = match operation {
            ContainerOperation::Start => Some((DeploymentStatus::Stopped, DeploymentStatus::Running)),
            ContainerOperation::Stop => Some((DeploymentStatus::Running, DeploymentStatus::Stopped)),
            ContainerOperation::Delete => None,
        };
        if let Some((required, target)) = expected {
            if record.status != required {
                return Err(ControlError::InvalidStateTransition {
                    from: record.status.as_str(),
                    to: target.as_str(),
                });
            }
        }

        self.enqueue(id, operation.into()).await
    }

    /// Run a container operation now.
    pub async fn apply_operation(
        &self,
        id: &DeploymentId,
        operation: ContainerOperation,
    ) -> ControlResult<()> {
        match operation {
            ContainerOperation::Start => self.start(id).await.map(|_| ()),
            ContainerOperation::Stop => self.stop(id).await.map(|_| ()),
            ContainerOperation::Delete => self.delete(id).await.map(|_| ()),
        }
    }

    async fn enqueue(&self, id: &DeploymentId, kind: JobKind) -> ControlResult<Job> {
        let job = Job::new(id.clone(), kind);
        let queue = self.queues.get(job.queue());
        self.broker.publish(queue, &job).await?;

        info!(
            deployment_id = %id,
            job_id = %job.job_id,
            job_type = job.kind.as_str(),
            queue = %queue.name(),
            "job enqueued"
        );
        Ok(job)
    }

    async fn stop_best_effort(&self, id: &DeploymentId) {
        if let Err(e) = self.stop(id).await {
            warn!(deployment_id = %id, error = %e, "failed to stop deployment, continuing");
        }
    }

    async fn remove_image_if_unused(&self, repository_id: &RepositoryId, tag: &str) {
        let siblings = match self
            .store
            .list(&DeploymentFilter::new().with_repository(repository_id.clone()))
            .await
        {
            Ok(siblings) => siblings,
            Err(e) => {
                warn!(image = %tag, error = %e, "failed to check image users, keeping image");
                return;
            }
        };

        if siblings.iter().any(|d| d.image_tag.as_deref() == Some(tag)) {
            return;
        }
        if let Err(e) = self.runtime.remove_image(tag).await {
            warn!(image = %tag, error = %e, "failed to remove image");
        }
    }
}

fn no_container(id: &DeploymentId) -> ControlError {
    ControlError::not_found(format!("no container for deployment {id}"))
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
