//! wharf deployment orchestration engine.
//!
//! Takes a repository URL, a branch and a build specification and turns them
//! into a running container on the local host. Builds run asynchronously on
//! worker processes fed by a durable job broker; callers observe progress
//! through the [`EventNotifier`].
//!
//! # Components
//!
//! - **Ledger** ([`DeploymentStore`]): repositories, deployments and
//!   containers, with transactional port-conflict checks
//! - **Pipeline** ([`PipelineExecutor`]): checkout, spec normalisation,
//!   manifest generation, image build and container run
//! - **Lifecycle** ([`LifecycleController`]): create, start, stop, delete,
//!   redeploy, rollback and push-triggered redeploys
//! - **History** ([`HistoryResolver`]): walks of the parent chain
//! - **Workers** ([`worker`]): broker handlers for the three job queues
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            ▼                              │
//! Pending ──▶ Building ──▶ Running ◀──▶ Stopped
//!    │           │
//!    └─────┬─────┘
//!          ▼
//!        Failed
//! ```
//!
//! Every state may also be reset to `Pending` by a redeploy.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod jobs;
pub mod lifecycle;
pub mod pipeline;
pub mod service;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

pub use config::ControlConfig;
pub use error::{ControlError, ControlResult};
pub use events::{DeploymentEvents, Event, EventNotifier, OperationStatus};
pub use history::{HistoryEntry, HistoryResolver};
pub use jobs::{Job, JobKind, QueueKind, Queues};
pub use lifecycle::LifecycleController;
pub use pipeline::{PipelineExecutor, PipelineOutcome};
pub use service::ControlService;
pub use state::check_transition;
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore};
pub use types::{
    BuildSpecInput, Container, ContainerLaunch, ContainerOperation, ContainerStatus,
    CreateDeployment, DeletedDeployment, DeploymentDetails, DeploymentId, DeploymentRecord,
    DeploymentStatus, NewDeployment, Repository, RepositoryId, RepositoryIdentity,
    SourcePushTrigger, UNKNOWN_COMMIT,
};
pub use worker::{ContainerJobHandler, DeploymentJobHandler, SourcePushHandler};
