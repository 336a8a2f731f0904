//! Container runtime abstraction.
//!
//! The pipeline and lifecycle operations talk to containers only through
//! [`ContainerRuntime`], so tests can swap the engine for a recording double.

mod docker;

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BuildResult;

pub use docker::DockerRuntime;

/// Length of the commit prefix used in image tags.
const TAG_COMMIT_LEN: usize = 7;

/// Builds images and manages container instances on the local host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `context` into an image tagged `tag`, forwarding output lines.
    async fn build_image(
        &self,
        tag: &str,
        context: &Path,
        output: mpsc::Sender<String>,
    ) -> BuildResult<()>;

    /// Start a detached container publishing `host_port` to `internal_port`.
    ///
    /// Returns the runtime-assigned container id.
    async fn run(&self, tag: &str, host_port: u16, internal_port: u16) -> BuildResult<String>;

    async fn start(&self, container_id: &str) -> BuildResult<()>;

    async fn stop(&self, container_id: &str) -> BuildResult<()>;

    /// Forcibly remove a container, running or not.
    async fn remove(&self, container_id: &str) -> BuildResult<()>;

    async fn remove_image(&self, tag: &str) -> BuildResult<()>;
}

/// Deterministic image tag for a repository at a commit.
///
/// `MyApp` at `3f2a9c1d...` becomes `myapp:3f2a9c1`.
#[must_use]
pub fn image_tag(repository_name: &str, commit_sha: &str) -> String {
    let name: String = repository_name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let commit = commit_sha.get(..TAG_COMMIT_LEN).unwrap_or(commit_sha);
    format!("{name}:{commit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_uses_lowercase_name_and_short_commit() {
        assert_eq!(
            image_tag("MyApp", "3f2a9c1d0e4b5a6978877665544332211ffeeddc"),
            "myapp:3f2a9c1"
        );
    }

    #[test]
    fn tag_is_deterministic() {
        let sha = "abcdef0123456789abcdef0123456789abcdef01";
        assert_eq!(image_tag("api", sha), image_tag("api", sha));
    }

    #[test]
    fn tag_replaces_characters_docker_rejects() {
        assert_eq!(image_tag("my app+x", "1234567"), "my-app-x:1234567");
    }
}
