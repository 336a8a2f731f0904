//! Deployment ledger backends.
//!
//! The ledger is the single source of truth for repositories, deployments and
//! containers. Every operation that touches more than one entity is applied
//! atomically, so a reader never sees a `RUNNING` deployment without its
//! container or a container without its deployment. PostgreSQL is the
//! production backend; the in-memory backend is used by tests and as a
//! development fallback.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use wharf_build::BuildSpec;

use crate::error::ControlResult;
use crate::types::{
    Container, ContainerLaunch, ContainerStatus, DeletedDeployment, DeploymentDetails,
    DeploymentId, DeploymentRecord, DeploymentStatus, NewDeployment, Repository, RepositoryId,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by repository.
    pub repository_id: Option<RepositoryId>,
    /// Filter by branch name.
    pub branch: Option<String>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Only direct children of this deployment.
    pub parent_id: Option<DeploymentId>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            repository_id: None,
            branch: None,
            status: None,
            parent_id: None,
            limit: None,
            offset: None,
        }
    }

    #[must_use]
    pub fn with_repository(mut self, repository_id: RepositoryId) -> Self {
        self.repository_id = Some(repository_id);
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: DeploymentId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn matches(&self, record: &DeploymentRecord) -> bool {
        self.repository_id
            .as_ref()
            .is_none_or(|id| record.repository_id == *id)
            && self.branch.as_ref().is_none_or(|b| record.branch == *b)
            && self.status.is_none_or(|s| record.status == s)
            && self
                .parent_id
                .as_ref()
                .is_none_or(|p| record.parent_deployment_id.as_ref() == Some(p))
    }
}

/// Backend for the deployment ledger.
///
/// Status-changing operations validate the move against the state machine
/// and fail with `InvalidStateTransition` rather than writing an illegal
/// state. Operations on a missing deployment fail with `NotFound`.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Create a `PENDING` deployment, creating its repository on first use.
    ///
    /// Fails with `Conflict` if another deployment holds the exposed port.
    /// The repository lookup, the port check and the insert happen in one
    /// transaction.
    async fn create_deployment(&self, request: &NewDeployment) -> ControlResult<DeploymentRecord>;

    /// Create a `PENDING` child of `parent` in the same repository and branch.
    ///
    /// The port is inherited and not re-checked; callers stop the parent first.
    async fn insert_child(
        &self,
        parent: &DeploymentId,
        commit_sha: &str,
        build_spec: &BuildSpec,
    ) -> ControlResult<DeploymentRecord>;

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Deployment with its repository and container.
    async fn get_details(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentDetails>>;

    async fn get_repository(&self, id: &RepositoryId) -> ControlResult<Option<Repository>>;

    /// List deployments matching the filter, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Replace the build spec. The exposed port column follows the spec.
    async fn update_build_spec(&self, id: &DeploymentId, spec: &BuildSpec) -> ControlResult<()>;

    /// Move to `to`, returning the previous status.
    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
    ) -> ControlResult<DeploymentStatus>;

    /// `PENDING -> BUILDING`, recording the resolved commit and clearing any
    /// previous error.
    async fn mark_building(&self, id: &DeploymentId, commit_sha: &str) -> ControlResult<()>;

    /// `BUILDING -> RUNNING` together with the container row, atomically.
    async fn mark_running(
        &self,
        id: &DeploymentId,
        launch: &ContainerLaunch,
    ) -> ControlResult<Container>;

    /// Move to `FAILED` with an error message. Already failed is a no-op.
    async fn mark_failed(&self, id: &DeploymentId, error: &str) -> ControlResult<()>;

    /// Reset to `PENDING` for another pipeline run, optionally replacing the
    /// build spec. An existing container row is marked stopped and kept.
    async fn reset_for_redeploy(
        &self,
        id: &DeploymentId,
        spec: Option<&BuildSpec>,
    ) -> ControlResult<DeploymentRecord>;

    /// Update the container and its deployment to the matching status
    /// together.
    async fn set_container_status(
        &self,
        id: &DeploymentId,
        status: ContainerStatus,
    ) -> ControlResult<Container>;

    /// Delete a deployment and its container, and its repository if nothing
    /// else references it. Children lose their parent link.
    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<DeletedDeployment>;
}
