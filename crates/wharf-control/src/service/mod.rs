//! Worker service lifecycle.
//!
//! Wires the ledger, broker, source cache, container runtime and notifier
//! together, runs one consumer per configured queue and handles graceful
//! shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wharf_build::{BuildLogStore, DockerRuntime, ProcessRunner, RepositoryCache};
use wharf_state::{JobBroker, StateProvider};

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::EventNotifier;
use crate::jobs::{QueueKind, Queues};
use crate::lifecycle::LifecycleController;
use crate::pipeline::PipelineExecutor;
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};
use crate::worker::{ContainerJobHandler, DeploymentJobHandler, SourcePushHandler};

/// The worker service.
///
/// Consumes the configured job queues until a shutdown signal arrives.
/// Shutdown stops new receives at once; jobs already running are awaited.
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn run(&self) -> ControlResult<()> {
        let store = self.create_store().await;

        let state = StateProvider::from_config(&self.config.state)
            .await
            .map_err(|e| ControlError::configuration(format!("state backends: {e}")))?;
        let queue_backend = state
            .queue()
            .map_err(|e| ControlError::configuration(e.to_string()))?;
        let locks = state
            .lock()
            .map_err(|e| ControlError::configuration(e.to_string()))?;

        let broker = JobBroker::new(queue_backend, self.config.broker.broker_config());
        let queues = Queues::from_config(&self.config.queues);

        let build = &self.config.build;
        let runner = ProcessRunner::new(build.limits.command_timeout());
        let runtime = Arc::new(
            DockerRuntime::new(runner.clone()).with_binary(&build.runtime.docker_binary),
        );
        let source = Arc::new(
            RepositoryCache::new(&build.paths.cache_dir, runner, Arc::clone(&locks))
                .with_git_binary(&build.runtime.git_binary)
                .with_lock_wait(build.limits.cache_lock_wait()),
        );
        let logs = BuildLogStore::new(&build.paths.log_dir);
        let notifier = EventNotifier::new(self.config.events.capacity);

        let pipeline = Arc::new(
            PipelineExecutor::new(
                Arc::clone(&store),
                source,
                runtime.clone(),
                locks,
                notifier.clone(),
                logs.clone(),
                &build.paths.workspace_dir,
            )
            .with_internal_port(build.runtime.internal_port)
            .with_lease(self.config.worker.deployment_lease()),
        );
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            runtime,
            broker.clone(),
            queues.clone(),
            notifier.clone(),
            logs,
        ));

        let mut tasks = JoinSet::new();
        tasks.spawn(log_events(notifier.clone(), self.cancel.clone()));

        for kind in &self.config.worker.queues {
            let queue = queues.get(*kind).clone();
            let broker = broker.clone();
            let cancel = self.cancel.clone();
            let prefetch = self.config.worker.prefetch;
            info!(queue = %queue.name(), prefetch, "starting consumer");

            match kind {
                QueueKind::Deployment => {
                    let handler = Arc::new(DeploymentJobHandler::new(Arc::clone(&pipeline)));
                    tasks.spawn(async move {
                        broker.consume(queue, handler, prefetch, cancel).await;
                    });
                }
                QueueKind::Container => {
                    let handler = Arc::new(ContainerJobHandler::new(
                        Arc::clone(&lifecycle),
                        Arc::clone(&store),
                        notifier.clone(),
                    ));
                    tasks.spawn(async move {
                        broker.consume(queue, handler, prefetch, cancel).await;
                    });
                }
                QueueKind::SourcePush => {
                    let handler = Arc::new(SourcePushHandler::new(Arc::clone(&lifecycle)));
                    tasks.spawn(async move {
                        broker.consume(queue, handler, prefetch, cancel).await;
                    });
                }
            }
        }

        info!(queues = ?self.config.worker.queues, "worker running");
        shutdown_signal(self.cancel.clone()).await;
        self.cancel.cancel();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task panicked");
            }
        }

        info!("worker shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn DeploymentStore> {
        let database = &self.config.database;
        match PostgresStore::new(&database.url, database.max_connections).await {
            Ok(store) => {
                info!(url = %database.url, "connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }
}

/// Mirror every event into the log so a worker without subscribers still
/// shows progress.
async fn log_events(notifier: EventNotifier, cancel: CancellationToken) {
    use tokio::sync::broadcast::error::RecvError;

    let mut events = notifier.subscribe_all();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => debug!(
                channel = event.channel(),
                deployment_id = %event.deployment_id(),
                "event published"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
