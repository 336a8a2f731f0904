//! Persistent per-deployment build logs.

use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::BuildResult;
use crate::source::sanitise_for_path;

const BUILD_LOG_FILE: &str = "build.log";

/// Root directory of build logs, one subdirectory per deployment.
#[derive(Debug, Clone)]
pub struct BuildLogStore {
    root: PathBuf,
}

impl BuildLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn deployment_dir(&self, deployment_id: &str) -> PathBuf {
        self.root.join(sanitise_for_path(deployment_id))
    }

    pub fn build_log_path(&self, deployment_id: &str) -> PathBuf {
        self.deployment_dir(deployment_id).join(BUILD_LOG_FILE)
    }

    /// Open the build log for appending, creating it if needed.
    pub async fn open(&self, deployment_id: &str) -> BuildResult<BuildLogWriter> {
        tokio::fs::create_dir_all(self.deployment_dir(deployment_id)).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.build_log_path(deployment_id))
            .await?;

        Ok(BuildLogWriter {
            file: BufWriter::new(file),
        })
    }

    /// Remove every log for a deployment. A missing directory is not an error.
    pub async fn remove(&self, deployment_id: &str) -> BuildResult<()> {
        let dir = self.deployment_dir(deployment_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "removed deployment logs");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Appends timestamped lines to a build log.
#[derive(Debug)]
pub struct BuildLogWriter {
    file: BufWriter<File>,
}

impl BuildLogWriter {
    /// Append `line` prefixed with the current UTC time.
    pub async fn write_line(&mut self, line: &str) -> BuildResult<()> {
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.file
            .write_all(format!("{stamp} {line}\n").as_bytes())
            .await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> BuildResult<()> {
        self.file.flush().await?;
        Ok(())
    }
}
