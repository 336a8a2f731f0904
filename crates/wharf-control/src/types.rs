//! Core types for wharf-control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wharf_build::BuildSpec;

use crate::error::{ControlError, ControlResult};

/// Commit value of a deployment whose commit has not been resolved yet.
pub const UNKNOWN_COMMIT: &str = "UNKNOWN";

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique ID using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);

ulid_id!(
    /// Unique identifier for a repository.
    RepositoryId
);

ulid_id!(
    /// Unique identifier for a container record.
    ContainerRecordId
);

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Running,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Building,
        Self::Running,
        Self::Stopped,
        Self::Failed,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether a deployment in this status reserves its exposed port.
    ///
    /// Pending and building deployments are on their way to running, so they
    /// hold the port as well.
    #[must_use]
    pub const fn holds_port(&self) -> bool {
        matches!(self, Self::Pending | Self::Building | Self::Running)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "BUILDING" => Ok(Self::Building),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Status of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Deployment status that accompanies this container status.
    #[must_use]
    pub const fn deployment_status(&self) -> DeploymentStatus {
        match self {
            Self::Running => DeploymentStatus::Running,
            Self::Stopped => DeploymentStatus::Stopped,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(format!("unknown container status: {s}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository
// ─────────────────────────────────────────────────────────────────────────────

/// Name and `owner/name` derived from a clone URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryIdentity {
    pub name: String,
    pub full_name: String,
}

impl RepositoryIdentity {
    /// Parse `https://host/owner/name(.git)` or `git@host:owner/name(.git)`.
    pub fn parse(clone_url: &str) -> ControlResult<Self> {
        let trimmed = clone_url.trim().trim_end_matches('/');

        let path = if let Some((_, rest)) = trimmed.split_once("://") {
            rest.split_once('/').map(|(_, path)| path)
        } else {
            trimmed.split_once(':').map(|(_, path)| path)
        };

        let invalid = || ControlError::configuration(format!("invalid repository URL: {clone_url}"));
        let path = path.ok_or_else(invalid)?;

        let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
        let name = segments
            .next()
            .map(|n| n.strip_suffix(".git").unwrap_or(n))
            .filter(|n| !n.is_empty())
            .ok_or_else(invalid)?;
        let owner = segments.next().ok_or_else(invalid)?;

        Ok(Self {
            name: name.to_owned(),
            full_name: format!("{owner}/{name}"),
        })
    }
}

/// A source repository. Created the first time its URL is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn from_url(clone_url: &str, default_branch: &str) -> ControlResult<Self> {
        let identity = RepositoryIdentity::parse(clone_url)?;
        Ok(Self {
            id: RepositoryId::generate(),
            name: identity.name,
            full_name: identity.full_name,
            clone_url: clone_url.to_owned(),
            default_branch: default_branch.to_owned(),
            created_at: Utc::now(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deployment
// ─────────────────────────────────────────────────────────────────────────────

/// A deployment record as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub repository_id: RepositoryId,
    pub branch: String,
    /// Resolved commit, or [`UNKNOWN_COMMIT`].
    pub commit_sha: String,
    pub build_spec: BuildSpec,
    /// Copy of `build_spec.exposed_port` for port lookups.
    pub exposed_port: u16,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_deployment_id: Option<DeploymentId>,
    /// Last failure message, cleared when a new attempt starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// A new pending deployment.
    #[must_use]
    pub fn new(
        repository_id: RepositoryId,
        branch: impl Into<String>,
        build_spec: BuildSpec,
        commit_sha: Option<String>,
        parent: Option<DeploymentId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            repository_id,
            branch: branch.into(),
            commit_sha: commit_sha.unwrap_or_else(|| UNKNOWN_COMMIT.to_owned()),
            exposed_port: build_spec.exposed_port,
            build_spec,
            status: DeploymentStatus::Pending,
            image_tag: None,
            parent_deployment_id: parent,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The commit to pin the checkout to, if one has been resolved.
    #[must_use]
    pub fn pinned_commit(&self) -> Option<&str> {
        (self.commit_sha != UNKNOWN_COMMIT).then_some(self.commit_sha.as_str())
    }
}

/// A container instance belonging to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: ContainerRecordId,
    pub deployment_id: DeploymentId,
    /// Runtime-assigned instance id.
    pub container_id: String,
    pub host_port: u16,
    pub status: ContainerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// What the runtime reported after starting a new container.
#[derive(Debug, Clone)]
pub struct ContainerLaunch {
    pub container_id: String,
    pub host_port: u16,
    pub image_tag: String,
}

/// An operation on an existing deployment's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerOperation {
    Start,
    Stop,
    Delete,
}

impl ContainerOperation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ContainerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A deployment with its repository and container loaded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDetails {
    #[serde(flatten)]
    pub deployment: DeploymentRecord,
    pub repository: Repository,
    pub container: Option<Container>,
}

/// Result of deleting a deployment from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedDeployment {
    pub deployment: DeploymentRecord,
    pub container: Option<Container>,
    /// The repository was removed because nothing else referenced it.
    pub repository_removed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Build specification as submitted by a client, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpecInput {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub exposed_port: Option<u16>,
    #[serde(default)]
    pub runtime_image: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
}

impl BuildSpecInput {
    /// Check the fields every deployment needs and produce a [`BuildSpec`].
    pub fn validate(self) -> ControlResult<BuildSpec> {
        let exposed_port = self
            .exposed_port
            .filter(|port| *port > 0)
            .ok_or_else(|| ControlError::configuration("Invalid buildSpec: exposedPort is required"))?;

        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !present(&self.language) && !present(&self.runtime_image) {
            return Err(ControlError::configuration(
                "Invalid buildSpec: language or runtimeImage is required",
            ));
        }

        Ok(BuildSpec {
            language: self.language,
            exposed_port,
            runtime_image: self.runtime_image,
            build_command: self.build_command,
            start_command: self.start_command,
        })
    }
}

impl From<BuildSpec> for BuildSpecInput {
    fn from(spec: BuildSpec) -> Self {
        Self {
            language: spec.language,
            exposed_port: Some(spec.exposed_port),
            runtime_image: spec.runtime_image,
            build_command: spec.build_command,
            start_command: spec.start_command,
        }
    }
}

/// A request to deploy a repository branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeployment {
    pub repo_url: String,
    pub branch: String,
    pub build_spec: BuildSpecInput,
}

/// A validated deployment request, as handed to the ledger.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub clone_url: String,
    pub branch: String,
    pub build_spec: BuildSpec,
}

/// Inbound push notification from the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePushTrigger {
    pub repository_id: RepositoryId,
    pub branch: String,
    pub commit_sha: String,
}
