//! Docker client abstraction
//!
//! The containerizer consumes a narrow slice of the Docker CLI surface:
//! `pull`, `run`, `stop`, `rm`, `inspect`, `ps`, `logs` and `wait`. The
//! [`DockerClient`] trait captures exactly that contract so the engine can be
//! driven by a deterministic double in tests; [`Cli`] is the production
//! implementation shelling out to the configured Docker binary.

mod cli;
pub mod name;

pub use cli::Cli;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{DockerNetwork, Parameter};

/// Error type for Docker CLI operations
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Failed to parse output of `{command}`: {message}")]
    Parse { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DockerResult<T> = Result<T, DockerError>;

/// A host path bind-mounted into a container.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Path on the host
    pub host_path: PathBuf,

    /// Path inside the container
    pub container_path: PathBuf,

    /// Mount read-only
    pub read_only: bool,
}

/// Everything needed to issue one `docker run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container name (`--name`)
    pub name: String,

    /// Image reference
    pub image: String,

    /// Argument vector run inside the container; empty keeps the image default
    pub command: Vec<String>,

    /// Environment variables (`-e`)
    pub env: HashMap<String, String>,

    /// Bind mounts (`-v`)
    pub volumes: Vec<Volume>,

    /// Network mode (`--net`)
    pub network: Option<DockerNetwork>,

    /// Run privileged
    pub privileged: bool,

    /// Free-form flags forwarded verbatim
    pub parameters: Vec<Parameter>,

    /// CPU shares (`--cpu-shares`)
    pub cpu_shares: Option<u64>,

    /// Memory limit in bytes (`--memory`)
    pub memory_bytes: Option<u64>,

    /// File receiving the container's stdout; inherits when unset
    pub stdout: Option<PathBuf>,

    /// File receiving the container's stderr; inherits when unset
    pub stderr: Option<PathBuf>,
}

/// The subset of `docker inspect` output the containerizer consumes.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    /// Full container id
    pub id: String,

    /// Container name without the leading slash
    pub name: String,

    /// Pid of the container's init process; `None` when not running
    pub pid: Option<i32>,

    /// Whether the container is currently running
    pub running: bool,
}

/// Client for the Docker CLI contract consumed by the containerizer.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Pull an image. When `force` is false an image already present locally
    /// is not pulled again.
    async fn pull(&self, image: &str, force: bool) -> DockerResult<()>;

    /// Run a container. The returned future resolves with the container's
    /// exit code once it terminates; callers are expected to hold on to the
    /// future rather than await it inline.
    async fn run(&self, options: RunOptions) -> DockerResult<i64>;

    /// Stop a container with the given grace period.
    async fn stop(&self, name: &str, timeout: Duration) -> DockerResult<()>;

    /// Remove a container.
    async fn rm(&self, name: &str, force: bool) -> DockerResult<()>;

    /// Inspect a container. Returns `Ok(None)` when no such container exists.
    async fn inspect(&self, name: &str) -> DockerResult<Option<ContainerDetails>>;

    /// List container names, optionally including stopped ones, filtered by
    /// a name prefix.
    async fn ps(&self, all: bool, name_filter: &str) -> DockerResult<Vec<String>>;

    /// Follow a container's output into `<directory>/stdout` and
    /// `<directory>/stderr`. Returns once the log streamer is started.
    async fn logs(&self, name: &str, directory: &Path) -> DockerResult<()>;

    /// Block until a container exits and return its exit code.
    async fn wait(&self, name: &str) -> DockerResult<i64>;
}
