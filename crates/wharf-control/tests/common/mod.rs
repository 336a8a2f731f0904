//! Common test utilities for wharf-control integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wharf_build::{
    BuildError, BuildLogStore, BuildResult, CheckoutRequest, ContainerRuntime, SourceCheckout,
    SourceProvider, MANIFEST_FILE,
};
use wharf_control::{
    ContainerJobHandler, CreateDeployment, DeploymentDetails, DeploymentId, DeploymentJobHandler,
    DeploymentRecord, DeploymentStatus, DeploymentStore, EventNotifier, LifecycleController,
    MemoryStore, PipelineExecutor, QueueKind, Queues, SourcePushHandler,
};
use wharf_state::{BrokerConfig, JobBroker, MemoryLockProvider, MemoryQueue, Outcome};

/// Source provider that materialises a fixed file set instead of cloning.
pub struct MockSource {
    head: Mutex<String>,
    files: Mutex<Vec<(String, String)>>,
    checkouts: Mutex<Vec<CheckoutRequest>>,
    failures: AtomicU32,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            head: Mutex::new(fixtures::commit(1)),
            files: Mutex::new(vec![(
                "package.json".to_owned(),
                r#"{"name":"storefront","scripts":{"start":"node index.js"}}"#.to_owned(),
            )]),
            checkouts: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Commit returned for unpinned checkouts from now on.
    pub fn set_head(&self, commit: impl Into<String>) {
        *self.head.lock().unwrap() = commit.into();
    }

    pub fn add_file(&self, name: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .push((name.to_owned(), contents.to_owned()));
    }

    /// Fail the next `n` checkouts.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.checkouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    async fn checkout(&self, request: &CheckoutRequest) -> BuildResult<SourceCheckout> {
        self.checkouts.lock().unwrap().push(request.clone());

        if take_failure(&self.failures) {
            return Err(BuildError::GitClone {
                url: request.clone_url.clone(),
                message: "remote end hung up unexpectedly".to_owned(),
            });
        }

        tokio::fs::create_dir_all(&request.workspace).await?;
        let files = self.files.lock().unwrap().clone();
        for (name, contents) in files {
            tokio::fs::write(request.workspace.join(name), contents).await?;
        }

        let commit_sha = match &request.pinned_commit {
            Some(commit) => commit.clone(),
            None => self.head.lock().unwrap().clone(),
        };

        Ok(SourceCheckout {
            path: request.workspace.clone(),
            commit_sha,
        })
    }
}

/// Container runtime that records every call.
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    build_output: Mutex<Vec<String>>,
    manifests: Mutex<Vec<String>>,
    contexts: Mutex<Vec<PathBuf>>,
    failing_builds: AtomicU32,
    containers: AtomicU32,
    build_delay: Mutex<Duration>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            build_output: Mutex::new(vec![
                "#1 [internal] load build definition from Dockerfile".to_owned(),
                "#2 [2/4] RUN npm install".to_owned(),
                "#3 exporting to image".to_owned(),
            ]),
            manifests: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            failing_builds: AtomicU32::new(0),
            containers: AtomicU32::new(0),
            build_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail the next `n` image builds with a non-zero exit.
    pub fn fail_builds(&self, n: u32) {
        self.failing_builds.store(n, Ordering::SeqCst);
    }

    /// Make every image build take at least `delay`.
    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Manifest contents seen by each build, in order.
    pub fn manifests(&self) -> Vec<String> {
        self.manifests.lock().unwrap().clone()
    }

    /// Build contexts, in order.
    pub fn contexts(&self) -> Vec<PathBuf> {
        self.contexts.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(
        &self,
        tag: &str,
        context: &Path,
        output: mpsc::Sender<String>,
    ) -> BuildResult<()> {
        self.record(format!("build {tag}"));
        self.contexts.lock().unwrap().push(context.to_path_buf());

        let manifest = tokio::fs::read_to_string(context.join(MANIFEST_FILE))
            .await
            .unwrap_or_default();
        self.manifests.lock().unwrap().push(manifest);

        let delay = *self.build_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let lines = self.build_output.lock().unwrap().clone();
        for line in lines {
            let _ = output.send(line).await;
        }

        if take_failure(&self.failing_builds) {
            let _ = output.send("npm ERR! missing script: build".to_owned()).await;
            return Err(BuildError::CommandFailed {
                program: "docker".to_owned(),
                exit_code: 1,
                stderr: "npm ERR! missing script: build".to_owned(),
            });
        }
        Ok(())
    }

    async fn run(&self, tag: &str, host_port: u16, internal_port: u16) -> BuildResult<String> {
        let n = self.containers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("run {tag} {host_port}:{internal_port}"));
        Ok(format!("container-{n}"))
    }

    async fn start(&self, container_id: &str) -> BuildResult<()> {
        self.record(format!("start {container_id}"));
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> BuildResult<()> {
        self.record(format!("stop {container_id}"));
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> BuildResult<()> {
        self.record(format!("rm {container_id}"));
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> BuildResult<()> {
        self.record(format!("rmi {tag}"));
        Ok(())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Complete test platform with all components wired together over the
/// in-memory ledger and queue.
pub struct TestPlatform {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub broker: JobBroker,
    pub queues: Queues,
    pub notifier: EventNotifier,
    pub logs: BuildLogStore,
    pub source: Arc<MockSource>,
    pub runtime: Arc<MockRuntime>,
    pub locks: Arc<MemoryLockProvider>,
    pub pipeline: Arc<PipelineExecutor>,
    pub lifecycle: Arc<LifecycleController>,
}

impl TestPlatform {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let broker = JobBroker::new(queue.clone(), BrokerConfig::default());
        let queues = Queues::default();
        let notifier = EventNotifier::default();
        let logs = BuildLogStore::new(dir.path().join("logs"));
        let source = Arc::new(MockSource::new());
        let runtime = Arc::new(MockRuntime::new());
        let locks = Arc::new(MemoryLockProvider::new());

        let pipeline = Arc::new(PipelineExecutor::new(
            store.clone(),
            source.clone(),
            runtime.clone(),
            locks.clone(),
            notifier.clone(),
            logs.clone(),
            dir.path().join("work"),
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            runtime.clone(),
            broker.clone(),
            queues.clone(),
            notifier.clone(),
            logs.clone(),
        ));

        Self {
            dir,
            store,
            queue,
            broker,
            queues,
            notifier,
            logs,
            source,
            runtime,
            locks,
            pipeline,
            lifecycle,
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn deployment_handler(&self) -> DeploymentJobHandler {
        DeploymentJobHandler::new(Arc::clone(&self.pipeline))
    }

    pub fn container_handler(&self) -> ContainerJobHandler {
        ContainerJobHandler::new(
            Arc::clone(&self.lifecycle),
            self.store.clone(),
            self.notifier.clone(),
        )
    }

    pub fn push_handler(&self) -> SourcePushHandler {
        SourcePushHandler::new(Arc::clone(&self.lifecycle))
    }

    /// Settle one message from the given queue, if any is waiting.
    pub async fn process(&self, kind: QueueKind) -> Option<Outcome> {
        let queue = self.queues.get(kind);
        let result = match kind {
            QueueKind::Deployment => {
                self.broker
                    .process_next(queue, &self.deployment_handler())
                    .await
            }
            QueueKind::Container => {
                self.broker
                    .process_next(queue, &self.container_handler())
                    .await
            }
            QueueKind::SourcePush => self.broker.process_next(queue, &self.push_handler()).await,
        };
        result.expect("broker")
    }

    /// Settle messages from the queue until it is empty, retries included.
    pub async fn drain(&self, kind: QueueKind) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process(kind).await {
            outcomes.push(outcome);
            assert!(outcomes.len() < 64, "queue {kind:?} never drained");
        }
        outcomes
    }

    pub async fn depth(&self, kind: QueueKind) -> usize {
        self.broker
            .depth(self.queues.get(kind))
            .await
            .expect("depth")
    }

    pub async fn dead_letters(&self, kind: QueueKind) -> usize {
        self.broker
            .dead_letter_depth(self.queues.get(kind))
            .await
            .expect("dead letter depth")
    }

    pub async fn record(&self, id: &DeploymentId) -> DeploymentRecord {
        self.store
            .get(id)
            .await
            .expect("get")
            .expect("deployment exists")
    }

    pub async fn details(&self, id: &DeploymentId) -> DeploymentDetails {
        self.store
            .get_details(id)
            .await
            .expect("get details")
            .expect("deployment exists")
    }

    pub async fn status(&self, id: &DeploymentId) -> DeploymentStatus {
        self.record(id).await.status
    }

    /// Create a deployment and run its build to completion.
    pub async fn deploy(&self, request: CreateDeployment) -> DeploymentRecord {
        let created = self.lifecycle.create(request).await.expect("create");
        self.drain(QueueKind::Deployment).await;
        self.record(&created.id).await
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}
