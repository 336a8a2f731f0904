//! Bare mirror cache keyed by repository URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use wharf_state::LockBackend;

use super::validate::{sanitise_for_path, validate_branch_name, validate_commit_sha};
use super::{CheckoutRequest, SourceCheckout, SourceProvider};
use crate::error::{BuildError, BuildResult};
use crate::process::ProcessRunner;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(15 * 60);

/// Shared cache of bare repository mirrors.
///
/// Mirrors are created with `git clone --mirror` and refreshed with
/// `git remote update --prune`. A mirror that fails to refresh is discarded
/// and cloned again. Access to a mirror is serialised across workers through
/// the lock `repo-cache:<url>`.
pub struct RepositoryCache {
    cache_dir: PathBuf,
    runner: ProcessRunner,
    git: String,
    locks: Arc<dyn LockBackend>,
    lock_wait: Duration,
}

impl RepositoryCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        runner: ProcessRunner,
        locks: Arc<dyn LockBackend>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            runner,
            git: "git".to_owned(),
            locks,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    #[must_use]
    pub fn with_git_binary(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// How long to wait for another worker's refresh before giving up.
    #[must_use]
    pub const fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Location of the mirror for `clone_url`.
    pub fn mirror_path(&self, clone_url: &str) -> PathBuf {
        self.cache_dir.join(sanitise_for_path(clone_url))
    }

    /// Bring the mirror for `clone_url` up to date, creating it if needed.
    ///
    /// Returns the mirror path.
    #[instrument(skip(self))]
    pub async fn refresh(&self, clone_url: &str) -> BuildResult<PathBuf> {
        let mirror = self.mirror_path(clone_url);
        let resource = format!("repo-cache:{clone_url}");

        // Held for longer than the worst case of a failed fetch plus a re-clone.
        let ttl = self.runner.default_timeout() * 3;
        let guard = tokio::time::timeout(self.lock_wait, self.locks.acquire(&resource, ttl))
            .await
            .map_err(|_| BuildError::CacheBusy(clone_url.to_owned()))?
            .map_err(|e| BuildError::Internal(format!("cache lock: {e}")))?;

        let result = self.refresh_locked(clone_url, &mirror).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release repository cache lock");
        }

        result.map(|()| mirror)
    }

    async fn refresh_locked(&self, clone_url: &str, mirror: &Path) -> BuildResult<()> {
        if mirror.exists() {
            match self.fetch(mirror).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, mirror = %mirror.display(), "mirror refresh failed, re-cloning");
                    tokio::fs::remove_dir_all(mirror).await?;
                }
            }
        }

        match self.clone_mirror(clone_url, mirror).await {
            Ok(()) => Ok(()),
            // Another process created the mirror between our check and clone.
            Err(e) if mirror.exists() => {
                warn!(error = %e, "mirror appeared during clone, fetching instead");
                self.fetch(mirror).await
            }
            Err(e) => Err(e),
        }
    }

    async fn clone_mirror(&self, clone_url: &str, mirror: &Path) -> BuildResult<()> {
        info!(url = %clone_url, path = %mirror.display(), "creating repository mirror");
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let cmd = self
            .runner
            .command(&self.git)
            .args(["clone", "--mirror", "--"])
            .arg(clone_url)
            .arg(mirror.display().to_string());

        self.runner.run(&cmd).await.map(drop).map_err(|e| {
            keep_timeout(e, |message| BuildError::GitClone {
                url: clone_url.to_owned(),
                message,
            })
        })
    }

    async fn fetch(&self, mirror: &Path) -> BuildResult<()> {
        debug!(path = %mirror.display(), "refreshing mirror");

        let cmd = self
            .runner
            .command(&self.git)
            .args(["remote", "update", "--prune"])
            .current_dir(mirror);

        self.runner
            .run(&cmd)
            .await
            .map(drop)
            .map_err(|e| keep_timeout(e, BuildError::GitFetch))
    }

    /// Clone `branch` from the mirror into `workspace` and resolve the commit.
    #[instrument(skip(self))]
    pub async fn materialise(
        &self,
        mirror: &Path,
        branch: &str,
        pinned_commit: Option<&str>,
        workspace: &Path,
    ) -> BuildResult<String> {
        validate_branch_name(branch)?;

        let clone = self
            .runner
            .command(&self.git)
            .args(["clone", "--branch", branch, "--"])
            .arg(mirror.display().to_string())
            .arg(workspace.display().to_string());

        self.runner.run(&clone).await.map_err(|e| {
            keep_timeout(e, |message| BuildError::GitClone {
                url: mirror.display().to_string(),
                message,
            })
        })?;

        if let Some(commit) = pinned_commit {
            validate_commit_sha(commit)?;

            let checkout = self
                .runner
                .command(&self.git)
                .args(["checkout", "--detach", commit])
                .current_dir(workspace);

            self.runner.run(&checkout).await.map_err(|e| {
                keep_timeout(e, |message| BuildError::GitCheckout {
                    commit: commit.to_owned(),
                    message,
                })
            })?;

            return Ok(commit.to_owned());
        }

        let rev_parse = self
            .runner
            .command(&self.git)
            .args(["rev-parse", "HEAD"])
            .current_dir(workspace);

        let output = self.runner.run(&rev_parse).await.map_err(|e| {
            keep_timeout(e, |message| BuildError::GitCheckout {
                commit: "HEAD".to_owned(),
                message,
            })
        })?;

        let commit = output.stdout.trim().to_owned();
        validate_commit_sha(&commit)?;
        Ok(commit)
    }
}

#[async_trait]
impl SourceProvider for RepositoryCache {
    async fn checkout(&self, request: &CheckoutRequest) -> BuildResult<SourceCheckout> {
        validate_branch_name(&request.branch)?;
        if let Some(commit) = &request.pinned_commit {
            validate_commit_sha(commit)?;
        }

        let mirror = self.refresh(&request.clone_url).await?;
        let commit_sha = self
            .materialise(
                &mirror,
                &request.branch,
                request.pinned_commit.as_deref(),
                &request.workspace,
            )
            .await?;

        info!(
            path = %request.workspace.display(),
            commit = %commit_sha,
            "checkout complete"
        );

        Ok(SourceCheckout {
            path: request.workspace.clone(),
            commit_sha,
        })
    }
}

impl std::fmt::Debug for RepositoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("cache_dir", &self.cache_dir)
            .field("git", &self.git)
            .finish_non_exhaustive()
    }
}

/// Rewrap a command failure as a git error, leaving timeouts intact.
fn keep_timeout(err: BuildError, wrap: impl FnOnce(String) -> BuildError) -> BuildError {
    if err.is_timeout() {
        err
    } else {
        wrap(err.to_string())
    }
}
