//! Deployment state machine.
//!
//! ```text
//!   PENDING ──▶ BUILDING ──▶ RUNNING ◀──▶ STOPPED
//!      │            │
//!      └────────────┴──▶ FAILED
//! ```
//!
//! Any state may be reset to `PENDING` by a redeploy, which starts a fresh
//! pipeline run against the same record. Deletion is valid from any state and
//! is not modelled as a transition.

use crate::error::{ControlError, ControlResult};
use crate::types::DeploymentStatus;

impl DeploymentStatus {
    /// Whether the machine allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use DeploymentStatus::{Building, Failed, Pending, Running, Stopped};

        matches!(
            (self, to),
            (_, Pending)
                | (Pending, Building | Failed)
                | (Building, Running | Failed)
                | (Running, Stopped)
                | (Stopped, Running)
        )
    }

    /// States with no outgoing transition other than a redeploy reset.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Check a transition, returning [`ControlError::InvalidStateTransition`] if
/// the machine forbids it.
pub fn check_transition(from: DeploymentStatus, to: DeploymentStatus) -> ControlResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ControlError::InvalidStateTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}
