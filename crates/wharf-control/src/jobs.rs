//! Job payloads and the queues they travel on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wharf_state::QueueSpec;

use crate::config::QueuesConfig;
use crate::types::{ContainerOperation, DeploymentId, RepositoryId};

/// A broker message: `{type, jobId, deploymentId, ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub deployment_id: DeploymentId,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl Job {
    pub fn new(deployment_id: DeploymentId, kind: JobKind) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            deployment_id,
            kind,
        }
    }

    /// Queue this job belongs on.
    #[must_use]
    pub const fn queue(&self) -> QueueKind {
        self.kind.queue()
    }
}

/// Type-specific part of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobKind {
    #[serde(rename = "deployment:create")]
    DeploymentCreate,
    #[serde(rename = "deployment:redeploy")]
    DeploymentRedeploy,
    #[serde(rename = "deployment:rollback")]
    DeploymentRollback,
    #[serde(rename = "container:start")]
    ContainerStart,
    #[serde(rename = "container:stop")]
    ContainerStop,
    #[serde(rename = "container:delete")]
    ContainerDelete,
    /// Redeploy a running deployment after a push to its branch.
    #[serde(rename = "source:push", rename_all = "camelCase")]
    SourcePush {
        repository_id: RepositoryId,
        branch: String,
        commit_sha: String,
    },
}

impl JobKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentCreate => "deployment:create",
            Self::DeploymentRedeploy => "deployment:redeploy",
            Self::DeploymentRollback => "deployment:rollback",
            Self::ContainerStart => "container:start",
            Self::ContainerStop => "container:stop",
            Self::ContainerDelete => "container:delete",
            Self::SourcePush { .. } => "source:push",
        }
    }

    #[must_use]
    pub const fn queue(&self) -> QueueKind {
        match self {
            Self::DeploymentCreate | Self::DeploymentRedeploy | Self::DeploymentRollback => {
                QueueKind::Deployment
            }
            Self::ContainerStart | Self::ContainerStop | Self::ContainerDelete => {
                QueueKind::Container
            }
            Self::SourcePush { .. } => QueueKind::SourcePush,
        }
    }

    /// Container operation carried by a `container:*` job.
    #[must_use]
    pub const fn container_operation(&self) -> Option<ContainerOperation> {
        match self {
            Self::ContainerStart => Some(ContainerOperation::Start),
            Self::ContainerStop => Some(ContainerOperation::Stop),
            Self::ContainerDelete => Some(ContainerOperation::Delete),
            _ => None,
        }
    }
}

impl From<ContainerOperation> for JobKind {
    fn from(op: ContainerOperation) -> Self {
        match op {
            ContainerOperation::Start => Self::ContainerStart,
            ContainerOperation::Stop => Self::ContainerStop,
            ContainerOperation::Delete => Self::ContainerDelete,
        }
    }
}

/// The three job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Deployment,
    Container,
    SourcePush,
}

impl QueueKind {
    pub const ALL: [Self; 3] = [Self::Deployment, Self::Container, Self::SourcePush];
}

/// Resolved queue specs for every [`QueueKind`].
#[derive(Debug, Clone)]
pub struct Queues {
    deployment: QueueSpec,
    container: QueueSpec,
    source_push: QueueSpec,
}

impl Queues {
    pub fn from_config(config: &QueuesConfig) -> Self {
        Self {
            deployment: QueueSpec::new(&config.deployment.name).with_ttl(config.deployment.ttl()),
            container: QueueSpec::new(&config.container.name).with_ttl(config.container.ttl()),
            source_push: QueueSpec::new(&config.source_push.name)
                .with_ttl(config.source_push.ttl()),
        }
    }

    #[must_use]
    pub const fn get(&self, kind: QueueKind) -> &QueueSpec {
        match kind {
            QueueKind::Deployment => &self.deployment,
            QueueKind::Container => &self.container,
            QueueKind::SourcePush => &self.source_push,
        }
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::from_config(&QueuesConfig::default())
    }
}
