//! Build-side plumbing for wharf deployments.
//!
//! This crate provides:
//! - A process runner with hard time limits
//! - A shared cache of bare repository mirrors
//! - Build spec normalisation and manifest generation
//! - A container runtime adapter over the Docker CLI
//! - Per-deployment build log files
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Repository  │───▶│   Manifest   │───▶│  Container   │
//! │    Cache     │    │  Generator   │    │   Runtime    │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!         │                                      │
//!         └──────────────────┬───────────────────┘
//!                            ▼
//!                    ┌──────────────┐
//!                    │Process Runner│
//!                    └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logs;
pub mod manifest;
pub mod process;
pub mod runtime;
pub mod source;
pub mod types;
pub mod workspace;

pub use config::{BuildConfig, LimitsConfig, PathsConfig, RuntimeConfig};
pub use error::{BuildError, BuildResult};
pub use logs::{BuildLogStore, BuildLogWriter};
pub use manifest::{ensure_manifest, ManifestSource, MANIFEST_FILE};
pub use process::{CommandSpec, ProcessOutput, ProcessRunner, DEFAULT_COMMAND_TIMEOUT};
pub use runtime::{image_tag, ContainerRuntime, DockerRuntime};
pub use source::{CheckoutRequest, RepositoryCache, SourceCheckout, SourceProvider};
pub use types::{BuildSpec, LanguageDefaults};
pub use workspace::Workspace;
