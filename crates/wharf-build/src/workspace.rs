//! Ephemeral per-attempt build directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BuildResult;

/// A fresh `build-<uuid>` path under the workspace root.
///
/// The directory itself is created by the checkout; allocation only reserves
/// a unique name. Every pipeline attempt gets its own workspace, so a retried
/// job never sees leftovers from the previous attempt.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Reserve a new workspace path, creating the root if needed.
    pub async fn allocate(root: &Path) -> BuildResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(format!("build-{}", Uuid::new_v4()));
        debug!(path = %path.display(), "allocated workspace");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace. Failures are logged, never returned.
    pub async fn cleanup(self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "removed workspace"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to clean up workspace"
            ),
        }
    }
}
