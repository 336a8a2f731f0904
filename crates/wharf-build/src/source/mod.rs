//! Source checkout through a shared cache of bare repository mirrors.
//!
//! Each repository URL gets one mirror under the cache directory. Builds
//! refresh the mirror under a cross-worker lock, then clone the requested
//! branch from it into a private workspace.

mod cache;
mod validate;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::BuildResult;

pub use cache::RepositoryCache;
pub use validate::{sanitise_for_path, validate_branch_name, validate_commit_sha};

/// What to check out and where.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// Clone URL of the repository.
    pub clone_url: String,
    /// Branch to clone.
    pub branch: String,
    /// Commit to pin to. `None` builds the branch head.
    pub pinned_commit: Option<String>,
    /// Destination directory. Must not exist yet.
    pub workspace: PathBuf,
}

/// A checked-out source directory ready for building.
#[derive(Debug, Clone)]
pub struct SourceCheckout {
    /// Path to the checkout directory.
    pub path: PathBuf,
    /// The commit that was checked out.
    pub commit_sha: String,
}

/// Materialises repository sources into a workspace.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn checkout(&self, request: &CheckoutRequest) -> BuildResult<SourceCheckout>;
}
