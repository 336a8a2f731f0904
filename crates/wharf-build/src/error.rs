//! Error types for source, manifest and runtime operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while preparing or running a build.
#[derive(Debug, Error)]
pub enum BuildError {
    // ─────────────────────────────────────────────────────────────────────────
    // Process errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The program could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name.
        program: String,
        /// Error message.
        message: String,
    },

    /// The program exited with a non-zero status.
    #[error("{program} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit code, `-1` when killed by a signal.
        exit_code: i32,
        /// Captured stderr (or combined output for streamed commands).
        stderr: String,
    },

    /// The program exceeded its time limit and was killed.
    #[error("{program} timed out after {limit:?}")]
    Timeout {
        /// Program name.
        program: String,
        /// Timeout limit.
        limit: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Source errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Git clone failed.
    #[error("failed to clone repository {url}: {message}")]
    GitClone {
        /// Repository URL.
        url: String,
        /// Error message.
        message: String,
    },

    /// Git fetch failed.
    #[error("failed to fetch from repository: {0}")]
    GitFetch(String),

    /// Git checkout failed.
    #[error("failed to checkout commit {commit}: {message}")]
    GitCheckout {
        /// Commit SHA.
        commit: String,
        /// Error message.
        message: String,
    },

    /// Invalid branch name (option injection, traversal, control characters).
    #[error("invalid branch name: {name} ({reason})")]
    InvalidBranchName {
        /// The invalid branch name.
        name: String,
        /// Reason for rejection.
        reason: String,
    },

    /// Another worker holds the cache entry for too long.
    #[error("repository cache busy: {0}")]
    CacheBusy(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Build specification errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The build specification cannot produce a runnable image.
    #[error("{0}")]
    Configuration(String),

    /// Failed to write the build manifest.
    #[error("failed to write build manifest {path}: {message}")]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Internal errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the failure came from a command exceeding its time limit.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for build operations.
pub type BuildResult<T> = Result<T, BuildError>;
