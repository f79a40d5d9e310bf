//! Configuration structures and loading

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main containerizer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Docker CLI settings
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Agent paths and recovery settings
    #[serde(default)]
    pub agent: AgentConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            docker: DockerConfiguration::default(),
            agent: AgentConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }

    /// Whether the agent itself runs inside a Docker container and must
    /// launch executor helpers nested in Docker.
    pub fn nested_in_docker(&self) -> bool {
        self.docker.mesos_image.is_some()
    }
}

/// Docker CLI configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Path to the Docker CLI binary
    #[serde(default = "default_docker_binary")]
    pub binary: PathBuf,

    /// Grace period in seconds passed to `docker stop`
    #[serde(default)]
    pub stop_timeout_secs: u64,

    /// Delay in seconds before `docker rm -f` during teardown
    #[serde(default = "default_remove_delay_secs")]
    pub remove_delay_secs: u64,

    /// Whether recovery stops unclaimed agent-named containers
    #[serde(default = "default_kill_orphans")]
    pub kill_orphans: bool,

    /// If set, run the executor helper inside a Docker container of this image
    #[serde(default)]
    pub mesos_image: Option<String>,

    /// Path to the Docker socket (mounted into a nested helper container)
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// Sandbox path mapped inside the container
    #[serde(default = "default_sandbox_directory")]
    pub sandbox_directory: PathBuf,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            stop_timeout_secs: 0,
            remove_delay_secs: default_remove_delay_secs(),
            kill_orphans: default_kill_orphans(),
            mesos_image: None,
            socket: default_docker_socket(),
            sandbox_directory: default_sandbox_directory(),
        }
    }
}

impl DockerConfiguration {
    /// Grace period forwarded to `docker stop`
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Delay before the forced removal of stopped containers
    pub fn remove_delay(&self) -> Duration {
        Duration::from_secs(self.remove_delay_secs)
    }
}

fn default_docker_binary() -> PathBuf {
    PathBuf::from("docker")
}

fn default_remove_delay_secs() -> u64 {
    6 * 60 * 60
}

fn default_kill_orphans() -> bool {
    true
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".into()
}

fn default_sandbox_directory() -> PathBuf {
    PathBuf::from("/mnt/mesos/sandbox")
}

/// Agent paths and recovery settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfiguration {
    /// Agent work directory (sandbox layout and checkpoints live below it)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Directory holding the executor helper binary
    #[serde(default = "default_launcher_dir")]
    pub launcher_dir: PathBuf,

    /// Executor recovery timeout in seconds, passed through to the helper env
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            launcher_dir: default_launcher_dir(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl AgentConfiguration {
    /// Recovery timeout forwarded to the executor helper
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/mesos")
}

fn default_launcher_dir() -> PathBuf {
    PathBuf::from("/usr/local/libexec/mesos")
}

fn default_recovery_timeout_secs() -> u64 {
    15 * 60
}
