//! Error types for wharf-control.

use wharf_build::BuildError;
use wharf_state::{HandlerError, LockError, QueueError};

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The build specification cannot produce a runnable deployment.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external command (git, docker) exited non-zero.
    #[error("external command failed: {0}")]
    ExternalCommand(String),

    /// An external command exceeded its time limit.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Deployment, container, repository or commit not found.
    #[error("{0}")]
    NotFound(String),

    /// The requested port is held by another deployment.
    #[error("port {port} is already in use by deployment {holder}")]
    Conflict {
        /// Contested host port.
        port: u16,
        /// Deployment currently holding it.
        holder: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job broker error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Lease on a shared resource could not be taken or kept.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Not-found error for a deployment id.
    #[must_use]
    pub fn deployment_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("deployment not found: {id}"))
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the broker should retry a job that failed with this error.
    ///
    /// Configuration, not-found, conflict and state errors will fail the same
    /// way on every attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_)
                | Self::NotFound(_)
                | Self::Conflict { .. }
                | Self::InvalidStateTransition { .. }
                | Self::Serialisation(_)
        )
    }
}

impl From<BuildError> for ControlError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Configuration(msg) => Self::Configuration(msg),
            BuildError::InvalidBranchName { .. } => Self::Configuration(err.to_string()),
            BuildError::Timeout { .. } => Self::Timeout(err.to_string()),
            BuildError::CommandFailed { .. }
            | BuildError::Spawn { .. }
            | BuildError::GitClone { .. }
            | BuildError::GitFetch(_)
            | BuildError::GitCheckout { .. }
            | BuildError::CacheBusy(_) => Self::ExternalCommand(err.to_string()),
            BuildError::Internal(msg) => Self::Internal(msg),
            BuildError::Manifest { .. } | BuildError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}

impl From<ControlError> for HandlerError {
    fn from(err: ControlError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn build_failures_map_onto_taxonomy() {
        let exit: ControlError = BuildError::CommandFailed {
            program: "docker".to_owned(),
            exit_code: 1,
            stderr: "no space left".to_owned(),
        }
        .into();
        assert!(matches!(exit, ControlError::ExternalCommand(_)));

        let timeout: ControlError = BuildError::Timeout {
            program: "git".to_owned(),
            limit: Duration::from_secs(420),
        }
        .into();
        assert!(matches!(timeout, ControlError::Timeout(_)));

        let config: ControlError = BuildError::configuration("bad").into();
        assert!(matches!(config, ControlError::Configuration(_)));
    }

    #[test]
    fn retryable_classes() {
        assert!(ControlError::ExternalCommand("x".into()).is_retryable());
        assert!(ControlError::Timeout("x".into()).is_retryable());
        assert!(ControlError::internal("x").is_retryable());
        assert!(!ControlError::configuration("x").is_retryable());
        assert!(!ControlError::not_found("x").is_retryable());
    }

    #[test]
    fn handler_error_follows_retryability() {
        let fatal: HandlerError = ControlError::configuration("no language").into();
        assert!(matches!(fatal, HandlerError::Fatal(_)));

        let retry: HandlerError = ControlError::Timeout("docker build".into()).into();
        assert!(matches!(retry, HandlerError::Retryable(_)));
    }

    #[test]
    fn configuration_message_is_passed_through() {
        let err: ControlError = BuildError::configuration(
            "Unsupported language 'cobol' and no runtime image provided.",
        )
        .into();
        assert_eq!(
            err.to_string(),
            "configuration error: Unsupported language 'cobol' and no runtime image provided."
        );
    }
}
