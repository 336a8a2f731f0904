//! Build-side configuration: filesystem locations, limits and tool binaries.
//!
//! These sections are embedded in the worker's `wharf.toml` under `[build]`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Build configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfig {
    /// Path configuration.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Time limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// External tool configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Path configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one bare mirror per repository URL.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Directory under which per-build workspaces are created.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Directory holding `<deployment id>/build.log`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            workspace_dir: default_workspace_dir(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf/repos")
}

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf/logs")
}

/// Time limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Limit for any single external command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// How long to wait for another worker to finish with a cache entry.
    #[serde(default = "default_cache_lock_wait_secs")]
    pub cache_lock_wait_secs: u64,
}

impl LimitsConfig {
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub const fn cache_lock_wait(&self) -> Duration {
        Duration::from_secs(self.cache_lock_wait_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            cache_lock_wait_secs: default_cache_lock_wait_secs(),
        }
    }
}

const fn default_command_timeout_secs() -> u64 {
    420
}

const fn default_cache_lock_wait_secs() -> u64 {
    900
}

/// External tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Container engine CLI.
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Git CLI.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,

    /// Port the application listens on inside its container.
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            git_binary: default_git_binary(),
            internal_port: default_internal_port(),
        }
    }
}

fn default_docker_binary() -> String {
    "docker".to_owned()
}

fn default_git_binary() -> String {
    "git".to_owned()
}

const fn default_internal_port() -> u16 {
    3000
}
