//! Docker CLI adapter.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, instrument};

use super::ContainerRuntime;
use crate::error::{BuildError, BuildResult};
use crate::process::ProcessRunner;

/// Drives the local Docker engine through its CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    runner: ProcessRunner,
    binary: String,
}

impl DockerRuntime {
    #[must_use]
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            binary: "docker".to_owned(),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn simple<I>(&self, args: I) -> BuildResult<String>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let cmd = self.runner.command(&self.binary).args(args);
        let output = self.runner.run(&cmd).await?;
        Ok(output.stdout.trim().to_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, output), fields(context = %context.display()))]
    async fn build_image(
        &self,
        tag: &str,
        context: &Path,
        output: mpsc::Sender<String>,
    ) -> BuildResult<()> {
        let cmd = self
            .runner
            .command(&self.binary)
            .args(["build", "--progress=plain", "-t", tag, "."])
            .current_dir(context);

        self.runner.run_streaming(&cmd, output).await?;
        info!(tag, "image built");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn run(&self, tag: &str, host_port: u16, internal_port: u16) -> BuildResult<String> {
        let publish = format!("{host_port}:{internal_port}");
        let stdout = self.simple(["run", "-d", "-p", &publish, tag]).await?;

        // The id is the final line; anything before it is pull progress.
        let container_id = stdout.lines().last().unwrap_or_default().trim().to_owned();
        if container_id.is_empty() {
            return Err(BuildError::Internal(format!(
                "{} run returned no container id",
                self.binary
            )));
        }

        info!(tag, container_id = %container_id, "container started");
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> BuildResult<()> {
        self.simple(["start", container_id]).await.map(drop)
    }

    async fn stop(&self, container_id: &str) -> BuildResult<()> {
        self.simple(["stop", container_id]).await.map(drop)
    }

    async fn remove(&self, container_id: &str) -> BuildResult<()> {
        self.simple(["rm", "-f", container_id]).await.map(drop)
    }

    async fn remove_image(&self, tag: &str) -> BuildResult<()> {
        self.simple(["rmi", "-f", tag]).await.map(drop)
    }
}
