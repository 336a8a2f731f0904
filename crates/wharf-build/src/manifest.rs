//! Container build manifest (`Dockerfile`) generation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{BuildError, BuildResult};
use crate::types::BuildSpec;

/// Name of the manifest at the root of a build context.
pub const MANIFEST_FILE: &str = "Dockerfile";

/// Where the manifest for a build came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// The repository ships its own manifest, used untouched.
    Repository(PathBuf),
    /// A manifest was generated from the build spec.
    Generated(PathBuf),
}

impl ManifestSource {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Repository(path) | Self::Generated(path) => path,
        }
    }
}

/// Render the manifest text for a normalised spec.
///
/// `RUN` and `CMD` lines are omitted when the corresponding command is unset.
pub fn render(spec: &BuildSpec) -> BuildResult<String> {
    let image = spec
        .runtime_image
        .as_deref()
        .ok_or_else(|| BuildError::configuration("no runtime image to build from"))?;

    let mut manifest = format!("FROM {image}\nWORKDIR /app\nCOPY . .\n");
    if let Some(build) = &spec.build_command {
        manifest.push_str(&format!("RUN {build}\n"));
    }
    manifest.push_str(&format!("EXPOSE {}\n", spec.exposed_port));
    if let Some(start) = &spec.start_command {
        manifest.push_str(&format!("CMD {start}\n"));
    }
    Ok(manifest)
}

/// Write a manifest into `context` unless one is already there.
pub async fn ensure_manifest(context: &Path, spec: &BuildSpec) -> BuildResult<ManifestSource> {
    let path = context.join(MANIFEST_FILE);
    let contents = render(spec)?;

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await;

    let mut file = match file {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "repository provides its own manifest");
            return Ok(ManifestSource::Repository(path));
        }
        Err(e) => return Err(manifest_error(&path, &e)),
    };

    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| manifest_error(&path, &e))?;
    file.flush().await.map_err(|e| manifest_error(&path, &e))?;

    info!(path = %path.display(), "generated build manifest");
    Ok(ManifestSource::Generated(path))
}

fn manifest_error(path: &Path, e: &std::io::Error) -> BuildError {
    BuildError::Manifest {
        path: path.to_owned(),
        message: e.to_string(),
    }
}
