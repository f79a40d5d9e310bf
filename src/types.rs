//! Core data model shared across the containerizer
//!
//! These types mirror the messages exchanged with the agent: identifiers,
//! resource allocations, executor and task descriptions, and the Termination
//! message delivered when a container is torn down.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque container identifier minted by the caller.
///
/// Uniqueness is the caller's responsibility; the containerizer only requires
/// that the value is printable and stable for the life of the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of the agent ("slave") that owns this containerizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlaveId(pub String);

impl SlaveId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlaveId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Resource allocation for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Fractional CPUs
    pub cpus: Option<f64>,

    /// Memory limit in bytes
    pub mem_bytes: Option<u64>,
}

impl Resources {
    /// True when neither CPU nor memory is set.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.mem_bytes.is_none()
    }
}

/// An artifact to place into the sandbox before launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Uri {
    /// Source location: an http(s) URL or a local path
    pub value: String,

    /// Mark the fetched file executable
    #[serde(default)]
    pub executable: bool,

    /// Extract recognised archives after download
    #[serde(default)]
    pub extract: bool,
}

/// Command description for an executor or task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Program to run (passed through a shell when `arguments` is empty)
    pub value: String,

    /// Explicit argument vector; bypasses the shell when non-empty
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Environment variables for the command
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Artifacts to fetch into the sandbox
    #[serde(default)]
    pub uris: Vec<Uri>,
}

/// Executor description carried by every launch request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Executor identifier, unique within the framework
    pub executor_id: String,

    /// Owning framework identifier
    pub framework_id: String,

    /// Command launching the executor
    #[serde(default)]
    pub command: CommandInfo,

    /// Container description; `None` or a non-Docker kind means this
    /// containerizer should decline the launch
    #[serde(default)]
    pub container: Option<ContainerInfo>,

    /// Declared executor resources
    #[serde(default)]
    pub resources: Resources,
}

/// Task description, present when the container wraps a single task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier
    pub task_id: String,

    /// Task command; falls back to the executor command when absent
    #[serde(default)]
    pub command: Option<CommandInfo>,

    /// Container description for the task
    #[serde(default)]
    pub container: Option<ContainerInfo>,

    /// Declared task resources
    #[serde(default)]
    pub resources: Resources,
}

/// Which containerizer a launch request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Mesos,
    Docker,
}

/// Container description attached to an executor or task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Requested containerizer kind
    pub kind: ContainerKind,

    /// Docker-specific settings, required when `kind` is Docker
    #[serde(default)]
    pub docker: Option<DockerInfo>,
}

impl ContainerInfo {
    /// Build a Docker container description for the given image.
    pub fn docker(image: &str) -> Self {
        Self {
            kind: ContainerKind::Docker,
            docker: Some(DockerInfo {
                image: image.to_string(),
                ..DockerInfo::default()
            }),
        }
    }
}

/// Docker-specific container settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerInfo {
    /// Image reference, e.g. `busybox:latest`
    pub image: String,

    /// Container network mode
    #[serde(default)]
    pub network: Option<DockerNetwork>,

    /// Run the container privileged
    #[serde(default)]
    pub privileged: bool,

    /// Pull the image even when present locally
    #[serde(default)]
    pub force_pull_image: bool,

    /// Additional `--key[=value]` flags passed verbatim to `docker run`
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Network mode for a Docker container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerNetwork {
    Host,
    Bridge,
    None,
}

impl DockerNetwork {
    /// Value passed to `docker run --net`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            DockerNetwork::Host => "host",
            DockerNetwork::Bridge => "bridge",
            DockerNetwork::None => "none",
        }
    }
}

/// A free-form Docker CLI flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// Seconds since the epoch at sampling time
    pub timestamp: f64,

    /// CPU allocation in fractional CPUs, from the last applied resources
    pub cpus_limit: Option<f64>,

    /// User-mode CPU time consumed, in seconds
    pub cpus_user_time_secs: Option<f64>,

    /// Kernel-mode CPU time consumed, in seconds
    pub cpus_system_time_secs: Option<f64>,

    /// Memory limit in bytes, from the last applied resources
    pub mem_limit_bytes: Option<u64>,

    /// Resident set size in bytes
    pub mem_rss_bytes: Option<u64>,
}

/// Message delivered when a container reaches the end of its life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    /// Whether the container was torn down by request rather than by exit
    pub killed: bool,

    /// Executor exit status, when the reaper observed one
    pub status: Option<i32>,

    /// Human-readable reason
    pub message: String,
}
