//! Docker CLI implementation of the client contract

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ContainerDetails, DockerClient, DockerError, DockerResult, RunOptions};

/// Exit codes at and above this value signal a Docker-level failure rather
/// than a container process exit (125 = daemon error, 126/127 = command not
/// runnable or not found).
const DOCKER_ERROR_STATUS: i32 = 125;

/// Docker client shelling out to the `docker` binary.
pub struct Cli {
    binary: PathBuf,
}

impl Cli {
    /// Create a client for the given Docker CLI binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Path to the Docker CLI binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn render(&self, args: &[String]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    /// Run a docker subcommand to completion, capturing its output.
    async fn output(&self, args: Vec<String>) -> DockerResult<std::process::Output> {
        let command = self.render(&args);
        debug!("Running {}", command);

        tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| DockerError::Spawn { command, source })
    }

    /// Run a docker subcommand, mapping non-zero exit to an error.
    async fn run_checked(&self, args: Vec<String>) -> DockerResult<std::process::Output> {
        let command = self.render(&args);
        let output = self.output(args).await?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(DockerError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn open_sink(path: &Path) -> DockerResult<std::fs::File> {
        Ok(std::fs::OpenOptions::new().create(true).append(true).open(path)?)
    }
}

#[async_trait]
impl DockerClient for Cli {
    async fn pull(&self, image: &str, force: bool) -> DockerResult<()> {
        if !force {
            let inspect = self
                .output(vec!["image".into(), "inspect".into(), image.into()])
                .await?;
            if inspect.status.success() {
                debug!("Image {} already present, skipping pull", image);
                return Ok(());
            }
        }

        self.run_checked(vec!["pull".into(), image.into()]).await?;
        debug!("Pulled image {}", image);
        Ok(())
    }

    async fn run(&self, options: RunOptions) -> DockerResult<i64> {
        let mut args: Vec<String> = vec!["run".into(), "--name".into(), options.name.clone()];

        for (key, value) in &options.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        for volume in &options.volumes {
            let mut spec = format!(
                "{}:{}",
                volume.host_path.display(),
                volume.container_path.display()
            );
            if volume.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        }

        if let Some(network) = options.network {
            args.push(format!("--net={}", network.as_arg()));
        }

        if options.privileged {
            args.push("--privileged".into());
        }

        if let Some(shares) = options.cpu_shares {
            args.push(format!("--cpu-shares={}", shares));
        }

        if let Some(memory) = options.memory_bytes {
            args.push(format!("--memory={}", memory));
        }

        for parameter in &options.parameters {
            match &parameter.value {
                Some(value) => args.push(format!("--{}={}", parameter.key, value)),
                None => args.push(format!("--{}", parameter.key)),
            }
        }

        args.push(options.image.clone());
        args.extend(options.command.iter().cloned());

        let command = self.render(&args);
        debug!("Running {}", command);

        let mut child = tokio::process::Command::new(&self.binary);
        child.args(&args).stdin(Stdio::null());

        match &options.stdout {
            Some(path) => child.stdout(Stdio::from(Self::open_sink(path)?)),
            None => child.stdout(Stdio::inherit()),
        };
        match &options.stderr {
            Some(path) => child.stderr(Stdio::from(Self::open_sink(path)?)),
            None => child.stderr(Stdio::inherit()),
        };

        let mut child = child
            .spawn()
            .map_err(|source| DockerError::Spawn { command: command.clone(), source })?;

        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);

        if code >= DOCKER_ERROR_STATUS {
            return Err(DockerError::CommandFailed {
                command,
                status: code,
                stderr: "docker run failed; see the sandbox stderr file".into(),
            });
        }

        Ok(code as i64)
    }

    async fn stop(&self, name: &str, timeout: Duration) -> DockerResult<()> {
        self.run_checked(vec![
            "stop".into(),
            format!("--time={}", timeout.as_secs()),
            name.into(),
        ])
        .await?;
        Ok(())
    }

    async fn rm(&self, name: &str, force: bool) -> DockerResult<()> {
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("--force".into());
        }
        args.push(name.into());

        self.run_checked(args).await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> DockerResult<Option<ContainerDetails>> {
        let args: Vec<String> =
            vec!["inspect".into(), "--type=container".into(), name.into()];
        let command = self.render(&args);
        let output = self.output(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(None);
            }
            return Err(DockerError::CommandFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        let entries: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DockerError::Parse { command: command.clone(), message: e.to_string() })?;

        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| DockerError::Parse {
                command,
                message: "empty inspect result".into(),
            })?;

        let running = entry.state.running;
        Ok(Some(ContainerDetails {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            // Docker reports pid 0 for containers that are not running.
            pid: Some(entry.state.pid).filter(|pid| *pid > 0),
            running,
        }))
    }

    async fn ps(&self, all: bool, name_filter: &str) -> DockerResult<Vec<String>> {
        let mut args: Vec<String> = vec!["ps".into()];
        if all {
            args.push("--all".into());
        }
        args.push(format!("--filter=name={}", name_filter));
        args.push("--format={{.Names}}".into());

        let output = self.run_checked(args).await?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().trim_start_matches('/').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn logs(&self, name: &str, directory: &Path) -> DockerResult<()> {
        let args: Vec<String> = vec!["logs".into(), "--follow".into(), name.into()];
        let command = self.render(&args);
        debug!("Running {}", command);

        let child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(Self::open_sink(&directory.join("stdout"))?))
            .stderr(Stdio::from(Self::open_sink(&directory.join("stderr"))?))
            .spawn()
            .map_err(|source| DockerError::Spawn { command, source })?;

        // The streamer lives until the container exits; it is intentionally
        // left unsupervised.
        drop(child);
        Ok(())
    }

    async fn wait(&self, name: &str) -> DockerResult<i64> {
        let args: Vec<String> = vec!["wait".into(), name.into()];
        let command = self.render(&args);
        let output = self.run_checked(args).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<i64>()
            .map_err(|e| DockerError::Parse { command, message: e.to_string() })
    }
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Name")]
    name: String,

    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Pid")]
    pid: i32,

    #[serde(rename = "Running")]
    running: bool,
}
