//! Status and log fan-out keyed by deployment id.
//!
//! The notifier is constructed once by the service and handed to the
//! pipeline, the lifecycle controller and the workers. Publishing never
//! blocks and never fails: with no subscribers an event is simply dropped.
//! Slow subscribers skip what they missed rather than holding up a build.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

use crate::types::{ContainerOperation, DeploymentId, DeploymentStatus};

/// Buffered events per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Outcome reported on the `container-operation` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
}

/// An event delivered to subscribers, tagged with its channel name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "channel", rename_all_fields = "camelCase")]
pub enum Event {
    /// Raw output from the image build.
    #[serde(rename = "build-logs")]
    BuildLogs {
        deployment_id: DeploymentId,
        chunk: String,
    },

    /// Emitted on every status transition.
    #[serde(rename = "deployment-status")]
    DeploymentStatus {
        deployment_id: DeploymentId,
        status: DeploymentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A child deployment replaced `deployment_id` (rollback or push redeploy).
    #[serde(rename = "new-deployment")]
    NewDeployment {
        deployment_id: DeploymentId,
        new_deployment_id: DeploymentId,
    },

    #[serde(rename = "container-operation")]
    ContainerOperation {
        deployment_id: DeploymentId,
        operation: ContainerOperation,
        status: OperationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Event {
    /// The deployment this event is keyed by.
    #[must_use]
    pub fn deployment_id(&self) -> &DeploymentId {
        match self {
            Self::BuildLogs { deployment_id, .. }
            | Self::DeploymentStatus { deployment_id, .. }
            | Self::NewDeployment { deployment_id, .. }
            | Self::ContainerOperation { deployment_id, .. } => deployment_id,
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &'static str {
        match self {
            Self::BuildLogs { .. } => "build-logs",
            Self::DeploymentStatus { .. } => "deployment-status",
            Self::NewDeployment { .. } => "new-deployment",
            Self::ContainerOperation { .. } => "container-operation",
        }
    }
}

/// Publish/subscribe hub for deployment events.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<Event>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn build_log(&self, deployment_id: &DeploymentId, chunk: impl Into<String>) {
        self.publish(Event::BuildLogs {
            deployment_id: deployment_id.clone(),
            chunk: chunk.into(),
        });
    }

    pub fn status(
        &self,
        deployment_id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<String>,
    ) {
        self.publish(Event::DeploymentStatus {
            deployment_id: deployment_id.clone(),
            status,
            error,
        });
    }

    pub fn new_deployment(&self, parent: &DeploymentId, child: &DeploymentId) {
        self.publish(Event::NewDeployment {
            deployment_id: parent.clone(),
            new_deployment_id: child.clone(),
        });
    }

    pub fn container_operation(
        &self,
        deployment_id: &DeploymentId,
        operation: ContainerOperation,
        result: Result<(), String>,
    ) {
        let (status, error) = match result {
            Ok(()) => (OperationStatus::Success, None),
            Err(e) => (OperationStatus::Failed, Some(e)),
        };
        self.publish(Event::ContainerOperation {
            deployment_id: deployment_id.clone(),
            operation,
            status,
            error,
        });
    }

    /// Events for one deployment, from now on.
    #[must_use]
    pub fn subscribe(&self, deployment_id: &DeploymentId) -> DeploymentEvents {
        DeploymentEvents {
            deployment_id: deployment_id.clone(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Every event, from now on.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// A subscription filtered to a single deployment.
#[derive(Debug)]
pub struct DeploymentEvents {
    deployment_id: DeploymentId,
    receiver: broadcast::Receiver<Event>,
}

impl DeploymentEvents {
    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    /// Wait for the next event. Returns `None` once every notifier is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.deployment_id() == &self.deployment_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(deployment_id = %self.deployment_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The next already-published event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.deployment_id() == &self.deployment_id => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything published so far.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
