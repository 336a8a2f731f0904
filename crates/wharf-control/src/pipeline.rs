//! The build/run pipeline.
//!
//! Given a deployment id, the executor checks out the source into a fresh
//! workspace, resolves the commit, normalises the build spec, writes a
//! manifest if the repository has none, builds the image and runs it. Every
//! attempt gets its own workspace, which is removed whatever the outcome, so
//! a redelivered job starts from a clean slate.
//!
//! A run holds the lease `deployment:<id>` for its whole length, refreshed in
//! the background, so two workers never build the same deployment at once.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use wharf_build::{
    ensure_manifest, image_tag, BuildLogStore, CheckoutRequest, ContainerRuntime, SourceProvider,
    Workspace,
};
use wharf_state::{LockBackend, LockGuard};

use crate::error::{ControlError, ControlResult};
use crate::events::EventNotifier;
use crate::store::DeploymentStore;
use crate::types::{Container, ContainerLaunch, DeploymentDetails, DeploymentId, DeploymentStatus};

/// Port the generated manifest's application listens on inside the container.
pub const DEFAULT_INTERNAL_PORT: u16 = 3000;

/// Output lines buffered between the build process and the log sinks.
const BUILD_OUTPUT_BUFFER: usize = 256;

/// Length of the per-deployment lease. It lapses this long after a worker
/// dies mid-run.
pub const DEFAULT_DEPLOYMENT_LEASE: Duration = Duration::from_secs(60);

/// What a pipeline run did.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// The deployment is now running in this container.
    Deployed(Container),
    /// The deployment had already been built; nothing was done.
    Skipped(DeploymentStatus),
    /// Another run holds the deployment's lease; nothing was done.
    InProgress,
}

/// Runs deployments from source to a running container.
pub struct PipelineExecutor {
    store: Arc<dyn DeploymentStore>,
    source: Arc<dyn SourceProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<dyn LockBackend>,
    notifier: EventNotifier,
    logs: BuildLogStore,
    workspace_root: PathBuf,
    internal_port: u16,
    lease: Duration,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        source: Arc<dyn SourceProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<dyn LockBackend>,
        notifier: EventNotifier,
        logs: BuildLogStore,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            source,
            runtime,
            locks,
            notifier,
            logs,
            workspace_root: workspace_root.into(),
            internal_port: DEFAULT_INTERNAL_PORT,
            lease: DEFAULT_DEPLOYMENT_LEASE,
        }
    }

    #[must_use]
    pub const fn with_internal_port(mut self, port: u16) -> Self {
        self.internal_port = port;
        self
    }

    /// Length of the per-deployment lease. Keep it below the broker's
    /// visibility timeout so a dead worker's lease lapses before its job is
    /// redelivered.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(Duration::from_millis(3));
        self
    }

    /// Run the pipeline for `id`.
    ///
    /// If another run holds the deployment's lease this returns
    /// [`PipelineOutcome::InProgress`] without touching the ledger.
    /// Deployments that are already running or stopped are left alone, which
    /// makes a redelivered job harmless. A failed deployment, or one left
    /// half-built by a worker whose lease lapsed, is reset and built again from
    /// scratch. On failure the deployment is marked `FAILED`, subscribers are
    /// told why, and the error is returned for the broker's retry policy.
    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn run(&self, id: &DeploymentId) -> ControlResult<PipelineOutcome> {
        let resource = format!("deployment:{id}");
        let Some(guard) = self.locks.try_acquire(&resource, self.lease).await? else {
            info!("deployment is being built by another worker, skipping");
            return Ok(PipelineOutcome::InProgress);
        };

        let result = self.hold(&guard, self.run_claimed(id)).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release deployment lease");
        }
        result
    }

    /// Drive `work` while refreshing `guard` every third of the lease.
    async fn hold<F, T>(&self, guard: &LockGuard, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let period = self.lease / 3;
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = refresh.tick() => {
                    if let Err(e) = guard.refresh(self.lease).await {
                        warn!(resource = %guard.resource(), error = %e, "failed to refresh deployment lease");
                    }
                }
            }
        }
    }

    async fn run_claimed(&self, id: &DeploymentId) -> ControlResult<PipelineOutcome> {
        let details = self
            .store
            .get_details(id)
            .await?
            .ok_or_else(|| ControlError::deployment_not_found(id))?;

        match details.deployment.status {
            status @ (DeploymentStatus::Running | DeploymentStatus::Stopped) => {
                info!(status = %status, "deployment already built, skipping");
                return Ok(PipelineOutcome::Skipped(status));
            }
            status @ (DeploymentStatus::Failed | DeploymentStatus::Building) => {
                info!(status = %status, "restarting pipeline from scratch");
                self.store.transition(id, DeploymentStatus::Pending).await?;
            }
            DeploymentStatus::Pending => {}
        }

        info!(
            repository = %details.repository.full_name,
            branch = %details.deployment.branch,
            commit = %details.deployment.commit_sha,
            "pipeline started"
        );

        let result = match Workspace::allocate(&self.workspace_root).await {
            Ok(workspace) => {
                let result = self.execute(&details, workspace.path()).await;
                workspace.cleanup().await;
                result
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(container) => {
                info!(
                    container_id = %container.container_id,
                    host_port = container.host_port,
                    "deployment running"
                );
                Ok(PipelineOutcome::Deployed(container))
            }
            Err(e) => {
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        details: &DeploymentDetails,
        workspace: &Path,
    ) -> ControlResult<Container> {
        let deployment = &details.deployment;
        let id = &deployment.id;

        let checkout = self
            .source
            .checkout(&CheckoutRequest {
                clone_url: details.repository.clone_url.clone(),
                branch: deployment.branch.clone(),
                pinned_commit: deployment.pinned_commit().map(ToOwned::to_owned),
                workspace: workspace.to_path_buf(),
            })
            .await?;
        info!(commit = %checkout.commit_sha, "source checked out");

        let tag = image_tag(&details.repository.name, &checkout.commit_sha);

        let spec = deployment.build_spec.normalised()?;
        self.store.update_build_spec(id, &spec).await?;

        let manifest = ensure_manifest(&checkout.path, &spec).await?;
        debug!(manifest = ?manifest, "build manifest ready");

        self.store.mark_building(id, &checkout.commit_sha).await?;
        self.notifier.status(id, DeploymentStatus::Building, None);

        self.build(id, &tag, &checkout.path).await?;
        info!(image = %tag, "image built");

        let container_id = self
            .runtime
            .run(&tag, spec.exposed_port, self.internal_port)
            .await?;

        let launch = ContainerLaunch {
            container_id,
            host_port: spec.exposed_port,
            image_tag: tag,
        };
        let container = match self.store.mark_running(id, &launch).await {
            Ok(container) => container,
            Err(e) => {
                // The ledger never learned about this container.
                if let Err(remove_err) = self.runtime.remove(&launch.container_id).await {
                    warn!(
                        container_id = %launch.container_id,
                        error = %remove_err,
                        "failed to remove untracked container"
                    );
                }
                return Err(e);
            }
        };
        self.notifier.status(id, DeploymentStatus::Running, None);

        Ok(container)
    }

    /// Build the image, copying every output line to the build log file and
    /// to `build-logs` subscribers.
    async fn build(&self, id: &DeploymentId, tag: &str, context: &Path) -> ControlResult<()> {
        let mut log = self.logs.open(id.as_str()).await?;
        let (tx, mut rx) = mpsc::channel::<String>(BUILD_OUTPUT_BUFFER);

        let notifier = self.notifier.clone();
        let deployment_id = id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = log.write_line(&line).await {
                    warn!(deployment_id = %deployment_id, error = %e, "failed to write build log");
                }
                notifier.build_log(&deployment_id, format!("{line}\n"));
            }
            if let Err(e) = log.flush().await {
                warn!(deployment_id = %deployment_id, error = %e, "failed to flush build log");
            }
        });

        let result = self.runtime.build_image(tag, context, tx).await;

        if let Err(e) = forwarder.await {
            warn!(deployment_id = %id, error = %e, "build log forwarder panicked");
        }

        result.map_err(Into::into)
    }

    /// Best-effort failure bookkeeping. Never masks the original error.
    ///
    /// Subscribers hear about the failure only if the ledger accepted it; a
    /// deployment that moved on (say, to `RUNNING`) keeps its status quietly.
    async fn fail(&self, id: &DeploymentId, err: &ControlError) {
        let message = err.to_string();
        error!(deployment_id = %id, error = %message, "deployment failed");

        if let Err(e) = self.store.mark_failed(id, &message).await {
            warn!(deployment_id = %id, error = %e, "failed to mark deployment failed");
            return;
        }
        self.notifier
            .status(id, DeploymentStatus::Failed, Some(message.clone()));

        let line = format!("Deployment Failed: {message}");
        self.notifier.build_log(id, format!("\n{line}\n"));

        match self.logs.open(id.as_str()).await {
            Ok(mut log) => {
                if let Err(e) = log.write_line(&line).await {
                    warn!(deployment_id = %id, error = %e, "failed to record failure in build log");
                } else if let Err(e) = log.flush().await {
                    warn!(deployment_id = %id, error = %e, "failed to flush build log");
                }
            }
            Err(e) => warn!(deployment_id = %id, error = %e, "failed to open build log"),
        }
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("workspace_root", &self.workspace_root)
            .field("internal_port", &self.internal_port)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use wharf_build::{BuildError, BuildResult, BuildSpec, SourceCheckout};
    use wharf_state::MemoryLockProvider;

    use crate::store::MemoryStore;
    use crate::types::NewDeployment;

    /// Source and runtime that must never be reached.
    struct Unreachable;

    #[async_trait]
    impl SourceProvider for Unreachable {
        async fn checkout(&self, _request: &CheckoutRequest) -> BuildResult<SourceCheckout> {
            Err(BuildError::Internal("checkout should not run".to_owned()))
        }
    }

    #[async_trait]
    impl ContainerRuntime for Unreachable {
        async fn build_image(
            &self,
            _tag: &str,
            _context: &Path,
            _output: mpsc::Sender<String>,
        ) -> BuildResult<()> {
            Err(BuildError::Internal("build should not run".to_owned()))
        }

        async fn run(&self, _tag: &str, _host: u16, _internal: u16) -> BuildResult<String> {
            Err(BuildError::Internal("run should not run".to_owned()))
        }

        async fn start(&self, _id: &str) -> BuildResult<()> {
            Ok(())
        }

        async fn stop(&self, _id: &str) -> BuildResult<()> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> BuildResult<()> {
            Ok(())
        }

        async fn remove_image(&self, _tag: &str) -> BuildResult<()> {
            Ok(())
        }
    }

    fn executor(store: Arc<MemoryStore>, tmp: &TempDir) -> PipelineExecutor {
        executor_with(store, Arc::new(MemoryLockProvider::new()), EventNotifier::default(), tmp)
    }

    fn executor_with(
        store: Arc<MemoryStore>,
        locks: Arc<MemoryLockProvider>,
        notifier: EventNotifier,
        tmp: &TempDir,
    ) -> PipelineExecutor {
        PipelineExecutor::new(
            store,
            Arc::new(Unreachable),
            Arc::new(Unreachable),
            locks,
            notifier,
            BuildLogStore::new(tmp.path().join("logs")),
            tmp.path().join("work"),
        )
    }

    async fn pending(store: &MemoryStore) -> DeploymentId {
        store
            .create_deployment(&NewDeployment {
                clone_url: "https://github.com/acme/api".to_owned(),
                branch: "main".to_owned(),
                build_spec: BuildSpec::new("node", 4000),
            })
            .await
            .expect("create")
            .id
    }

    #[tokio::test]
    async fn missing_deployment_is_not_found() {
        let tmp = TempDir::new().expect("tempdir");
        let pipeline = executor(Arc::new(MemoryStore::new()), &tmp);

        let err = pipeline.run(&DeploymentId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn built_deployments_are_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let record = store
            .create_deployment(&NewDeployment {
                clone_url: "https://github.com/acme/api".to_owned(),
                branch: "main".to_owned(),
                build_spec: BuildSpec::new("node", 4000),
            })
            .await
            .expect("create");
        store.mark_building(&record.id, "abc1234").await.expect("building");
        store
            .mark_running(
                &record.id,
                &ContainerLaunch {
                    container_id: "c0ffee".to_owned(),
                    host_port: 4000,
                    image_tag: "api:abc1234".to_owned(),
                },
            )
            .await
            .expect("running");

        let outcome = executor(Arc::clone(&store), &tmp)
            .run(&record.id)
            .await
            .expect("run");
        assert!(matches!(
            outcome,
            PipelineOutcome::Skipped(DeploymentStatus::Running)
        ));
    }

    #[tokio::test]
    async fn checkout_failure_marks_failed_and_logs() {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let record = store
            .create_deployment(&NewDeployment {
                clone_url: "https://github.com/acme/api".to_owned(),
                branch: "main".to_owned(),
                build_spec: BuildSpec::new("node", 4000),
            })
            .await
            .expect("create");

        let pipeline = executor(Arc::clone(&store), &tmp);
        let err = pipeline.run(&record.id).await.unwrap_err();
        assert!(err.is_retryable());

        let record = store.get(&record.id).await.expect("get").expect("exists");
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.error.is_some());

        let log = tokio::fs::read_to_string(pipeline.logs.build_log_path(record.id.as_str()))
            .await
            .expect("build log");
        assert!(log.contains("Deployment Failed: internal error: checkout should not run"));
    }

    #[tokio::test]
    async fn held_lease_leaves_deployment_alone() {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockProvider::new());
        let id = pending(&store).await;
        store.mark_building(&id, "abc1234").await.expect("building");

        let _held = locks
            .try_acquire(&format!("deployment:{id}"), Duration::from_secs(30))
            .await
            .expect("lock")
            .expect("free");

        let outcome = executor_with(Arc::clone(&store), locks, EventNotifier::default(), &tmp)
            .run(&id)
            .await
            .expect("run");
        assert!(matches!(outcome, PipelineOutcome::InProgress));

        let record = store.get(&id).await.expect("get").expect("exists");
        assert_eq!(record.status, DeploymentStatus::Building);
    }

    #[tokio::test]
    async fn lease_is_released_after_run() {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockProvider::new());
        let id = pending(&store).await;

        let pipeline = executor_with(
            Arc::clone(&store),
            Arc::clone(&locks),
            EventNotifier::default(),
            &tmp,
        );
        pipeline.run(&id).await.unwrap_err();

        let again = locks
            .try_acquire(&format!("deployment:{id}"), Duration::from_secs(30))
            .await
            .expect("lock");
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn rejected_failure_emits_nothing() {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let notifier = EventNotifier::default();
        let id = pending(&store).await;
        store.mark_building(&id, "abc1234").await.expect("building");
        store
            .mark_running(
                &id,
                &ContainerLaunch {
                    container_id: "c0ffee".to_owned(),
                    host_port: 4000,
                    image_tag: "api:abc1234".to_owned(),
                },
            )
            .await
            .expect("running");

        let pipeline = executor_with(
            Arc::clone(&store),
            Arc::new(MemoryLockProvider::new()),
            notifier.clone(),
            &tmp,
        );
        let mut events = notifier.subscribe(&id);
        pipeline
            .fail(&id, &ControlError::Internal("late failure".to_owned()))
            .await;

        assert!(events.drain().is_empty());
        let record = store.get(&id).await.expect("get").expect("exists");
        assert_eq!(record.status, DeploymentStatus::Running);
        assert!(record.error.is_none());
        assert!(!pipeline.logs.build_log_path(id.as_str()).exists());
    }
}
