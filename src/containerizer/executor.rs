//! Executor helper launching
//!
//! The executor helper (`mesos-docker-executor`) brokers between the agent
//! and Docker. It is normally forked locally. When the agent itself runs
//! inside Docker it is started in its own container instead, with liveness
//! tracked by a spawned `docker wait` stand-in process whose pid can be
//! reaped and checkpointed like a local fork.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::docker::{DockerClient, RunOptions, Volume};

use super::container::Container;
use super::Error;

/// Name of the helper binary under the launcher directory.
pub const EXECUTOR_BINARY: &str = "mesos-docker-executor";

/// A launched helper: the pid to checkpoint and reap, and the child handle
/// the reaper waits on.
pub struct ExecutorHandle {
    pub pid: i32,
    pub child: Child,
}

/// Agent-provided environment for the helper, merged over the framework's
/// executor environment.
fn executor_environment(
    config: &Configuration,
    container: &Container,
    directory: &Path,
) -> HashMap<String, String> {
    let mut env = container.executor.command.environment.clone();

    env.insert("MESOS_FRAMEWORK_ID".into(), container.executor.framework_id.clone());
    env.insert("MESOS_EXECUTOR_ID".into(), container.executor.executor_id.clone());
    env.insert("MESOS_SLAVE_ID".into(), container.slave_id.to_string());
    env.insert("MESOS_SLAVE_PID".into(), container.slave_pid.clone());
    env.insert(
        "MESOS_CHECKPOINT".into(),
        if container.checkpoint { "1" } else { "0" }.into(),
    );
    env.insert(
        "MESOS_RECOVERY_TIMEOUT".into(),
        format!("{}secs", config.agent.recovery_timeout_secs),
    );
    env.insert("MESOS_DIRECTORY".into(), directory.display().to_string());
    env.insert(
        "MESOS_SANDBOX".into(),
        config.docker.sandbox_directory.display().to_string(),
    );

    // Glog verbosity is passed through when the agent runs with one.
    if let Ok(glog) = std::env::var("GLOG_v") {
        env.insert("GLOG_v".into(), glog);
    }

    env
}

/// Fork the helper locally.
///
/// stdin is piped for the startup handshake, output goes to the sandbox log
/// files, and the child calls `setsid` so the whole helper tree can be
/// signalled as one process group.
pub fn launch_local(
    config: &Configuration,
    container: &Container,
    directory: &Path,
) -> Result<ExecutorHandle, Error> {
    let binary = config.agent.launcher_dir.join(EXECUTOR_BINARY);

    let stdout = open_sink(&directory.join("stdout"))?;
    let stderr = open_sink(&directory.join("stderr"))?;

    let mut command = tokio::process::Command::new(&binary);
    command
        .arg(format!("--docker={}", config.docker.binary.display()))
        .arg(format!("--container={}", container.name))
        .envs(executor_environment(config, container, directory))
        .current_dir(directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        Error::Executor(format!("Failed to fork {}: {}", binary.display(), e))
    })?;

    let pid = child.id().ok_or_else(|| {
        Error::Executor("Forked executor helper exited before it was observed".into())
    })? as i32;

    debug!("Forked executor helper {} for container {}", pid, container.id);
    Ok(ExecutorHandle { pid, child })
}

/// Complete the parent side of the startup handshake: one byte on the
/// helper's stdin, written only after its pid has been checkpointed. On
/// failure the pipe is closed, which makes the helper abort.
pub async fn handshake(child: &mut Child) -> Result<(), Error> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Executor("Executor helper has no stdin pipe".into()))?;

    let result = stdin.write_all(&[0]).await;
    // Dropping the handle closes the pipe either way; the helper has read
    // its byte by then or aborts on EOF.
    drop(stdin);

    result.map_err(|e| Error::Executor(format!("Executor handshake failed: {}", e)))
}

/// Start the helper inside its own Docker container (agent-in-Docker mode)
/// and return a `docker wait` stand-in child for liveness tracking.
pub async fn launch_nested(
    docker: &Arc<dyn DockerClient>,
    config: &Configuration,
    container: &Container,
    directory: &Path,
) -> Result<ExecutorHandle, Error> {
    let image = config
        .docker
        .mesos_image
        .clone()
        .ok_or_else(|| Error::Executor("Nested launch requires a configured agent image".into()))?;

    let binary = config.agent.launcher_dir.join(EXECUTOR_BINARY);
    let command = vec![
        binary.display().to_string(),
        format!("--docker={}", config.docker.binary.display()),
        format!("--container={}", container.name),
        format!("--sandbox_directory={}", directory.display()),
        format!("--mapped_directory={}", config.docker.sandbox_directory.display()),
    ];

    let options = RunOptions {
        name: container.executor_name.clone(),
        image,
        command,
        env: executor_environment(config, container, directory),
        volumes: vec![
            Volume {
                host_path: config.docker.socket.clone().into(),
                container_path: config.docker.socket.clone().into(),
                read_only: true,
            },
            Volume {
                host_path: directory.to_path_buf(),
                container_path: directory.to_path_buf(),
                read_only: false,
            },
        ],
        ..RunOptions::default()
    };

    // The helper container lives until the executor exits; its run future is
    // observed only for logging. Liveness goes through the wait stand-in,
    // which is the one thing that survives an agent restart.
    let helper_name = container.executor_name.clone();
    let run_client = docker.clone();
    tokio::spawn(async move {
        if let Err(e) = run_client.run(options).await {
            warn!("Executor helper container {} failed: {}", helper_name, e);
        }
    });

    let child = spawn_wait_standin(&config.docker.binary, &container.executor_name)
        .map_err(|e| Error::Executor(format!("Failed to spawn docker wait: {}", e)))?;

    let pid = child.id().ok_or_else(|| {
        Error::Executor("docker wait stand-in exited before it was observed".into())
    })? as i32;

    debug!(
        "Spawned docker wait stand-in {} for helper container {}",
        pid, container.executor_name
    );
    Ok(ExecutorHandle { pid, child })
}

/// Spawn `sh -c "exit `docker wait <name>`"`: a local process that lives
/// exactly as long as the named container and exits with its status.
pub fn spawn_wait_standin(binary: &Path, name: &str) -> std::io::Result<Child> {
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("exit `{} wait {}`", binary.display(), name))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

fn open_sink(path: &Path) -> Result<std::fs::File, Error> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::Executor(format!("Failed to open {}: {}", path.display(), e)))
}
