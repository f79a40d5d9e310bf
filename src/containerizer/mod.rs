//! The containerizer engine
//!
//! Public operations (`launch`, `update`, `usage`, `wait`, `destroy`,
//! `containers`, `recover`) drive a per-container state machine:
//!
//! ```text
//! FETCHING -> PULLING -> RUNNING -> DESTROYING
//! ```
//!
//! A destroy is legal at any point. The launch pipeline is a sequence of
//! awaits; after every await it re-acquires its container from the registry
//! so a racing destroy always wins. Destruction fulfils the termination
//! promise exactly once and is the only path that removes a record.

mod container;
mod executor;
mod recover;

pub use container::{Container, State};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cgroups;
use crate::checkpoint;
use crate::config::Configuration;
use crate::docker::{self, DockerClient, DockerError, RunOptions, Volume};
use crate::fetcher::{FetchError, Fetcher};
use crate::probe::{self, ProbeError, ResourceProbe};
use crate::reaper;
use crate::sandbox::{self, SandboxError};
use crate::types::{
    ContainerId, ContainerKind, ExecutorInfo, Resources, ResourceStatistics, SlaveId, TaskInfo,
    Termination,
};

/// Error type for containerizer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Container {0} has already been launched")]
    AlreadyLaunched(ContainerId),

    #[error("Unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error("Container {0} is being destroyed")]
    BeingDestroyed(ContainerId),

    #[error("Container {container_id} was destroyed while {stage}")]
    Destroyed {
        container_id: ContainerId,
        stage: &'static str,
    },

    #[error("Container info names a Docker container but carries no Docker settings")]
    MissingDockerInfo,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Failed to fetch artifacts: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error(transparent)]
    Cgroup(#[from] cgroups::CgroupError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("{0}")]
    Executor(String),

    #[error("Pid {pid} was already claimed by container {claimed_by} during recovery")]
    DuplicatePid { pid: i32, claimed_by: ContainerId },

    #[error("{0}")]
    Termination(String),
}

/// A launch request from the agent.
#[derive(Debug, Clone)]
pub struct Launch {
    pub container_id: ContainerId,

    /// Present when the container wraps a single task
    pub task: Option<TaskInfo>,

    pub executor: ExecutorInfo,

    /// Sandbox directory allocated by the agent
    pub directory: PathBuf,

    /// Run-as user for sandbox ownership
    pub user: Option<String>,

    pub slave_id: SlaveId,

    /// Agent endpoint handed to the executor
    pub slave_pid: String,

    /// Whether to checkpoint the forked helper pid
    pub checkpoint: bool,
}

struct Inner {
    config: Configuration,
    docker: Arc<dyn DockerClient>,
    fetcher: Arc<dyn Fetcher>,
    probe: Arc<dyn ResourceProbe>,
    containers: DashMap<ContainerId, Arc<Container>>,
}

/// The Docker containerizer. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Containerizer {
    inner: Arc<Inner>,
}

impl Containerizer {
    /// Create a containerizer over explicit collaborators. Tests use this to
    /// supply deterministic doubles.
    pub fn new(
        config: Configuration,
        docker: Arc<dyn DockerClient>,
        fetcher: Arc<dyn Fetcher>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                docker,
                fetcher,
                probe,
                containers: DashMap::new(),
            }),
        }
    }

    /// Create a containerizer wired to the local Docker CLI, the default
    /// artifact fetcher and the /proc usage probe.
    pub fn local(config: Configuration) -> Self {
        let docker = Arc::new(docker::Cli::new(config.docker.binary.clone()));
        Self::new(
            config,
            docker,
            Arc::new(crate::fetcher::UriFetcher::new()),
            Arc::new(probe::ProcProbe),
        )
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Launch an executor (optionally wrapping a task) in a Docker container.
    ///
    /// Returns `Ok(false)` (not an error) when the request does not name a
    /// Docker container, so the agent can fall through to another
    /// containerizer. Resolves `Ok(true)` once the executor is running and
    /// its reaper is armed.
    pub async fn launch(&self, launch: Launch) -> Result<bool, Error> {
        let container_info = match &launch.task {
            Some(task) => task.container.as_ref(),
            None => launch.executor.container.as_ref(),
        };

        let info = match container_info {
            Some(info) if info.kind == ContainerKind::Docker => info,
            _ => return Ok(false),
        };
        let docker_info = info.docker.clone().ok_or(Error::MissingDockerInfo)?;

        let id = launch.container_id.clone();
        if self.inner.containers.contains_key(&id) {
            return Err(Error::AlreadyLaunched(id));
        }

        // Sandbox preparation happens before the registry insertion so a
        // failure here never leaves a record behind.
        let prepared = sandbox::prepare(
            &launch.directory,
            launch.user.as_deref(),
            &self.inner.config.agent.work_dir,
            &launch.slave_id,
            &id,
        )
        .await?;

        let directory = prepared.directory.clone();
        let container = Arc::new(Container::new(
            launch,
            docker_info,
            prepared.directory,
            prepared.symlinked,
        ));

        use dashmap::mapref::entry::Entry;
        match self.inner.containers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyLaunched(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(container.clone());
            }
        }

        info!("Starting container {} (Docker name {})", id, container.name);

        match self.launch_pipeline(container, directory).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Failed to launch container {}: {}", id, e);
                // The originating message rides on the termination.
                self.destroy_with(&id, true, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Apply a new resource allocation to a running container's cgroups.
    ///
    /// A no-op on unknown containers, containers being destroyed, identical
    /// allocations, when the agent itself is nested in Docker, and on
    /// platforms without cgroups.
    pub async fn update(&self, id: &ContainerId, resources: Resources) -> Result<(), Error> {
        let container = match self.lookup(id) {
            Some(container) => container,
            None => {
                debug!("Ignoring update for unknown container {}", id);
                return Ok(());
            }
        };

        if container.state() == State::Destroying {
            debug!("Ignoring update for container {} being destroyed", id);
            return Ok(());
        }

        if *container.resources.read() == resources {
            return Ok(());
        }

        if self.inner.config.nested_in_docker() {
            debug!("Ignoring update while running nested in Docker");
            return Ok(());
        }

        if resources.is_empty() {
            return Ok(());
        }

        // The allocation is recorded as applied before the cgroup writes so
        // a repeated request short-circuits on the identity check above.
        *container.resources.write() = resources;

        #[cfg(target_os = "linux")]
        self.update_cgroups(&container, &resources).await?;

        #[cfg(not(target_os = "linux"))]
        debug!("Resource updates are a no-op on this platform");

        Ok(())
    }

    /// Resource usage of a container, with the declared limits attached.
    pub async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics, Error> {
        let container = self
            .lookup(id)
            .ok_or_else(|| Error::UnknownContainer(id.clone()))?;

        if container.state() == State::Destroying {
            return Err(Error::BeingDestroyed(id.clone()));
        }

        // Statistics are not gathered when the agent is itself containerized.
        if self.inner.config.nested_in_docker() {
            return Ok(ResourceStatistics {
                timestamp: probe::timestamp(),
                ..ResourceStatistics::default()
            });
        }

        let resources = *container.resources.read();
        let limits = |mut stats: ResourceStatistics| {
            stats.cpus_limit = resources.cpus;
            stats.mem_limit_bytes = resources.mem_bytes;
            stats
        };

        let pid = match self.resolve_pid(&container).await? {
            Some(pid) => pid,
            None => {
                return Ok(limits(ResourceStatistics {
                    timestamp: probe::timestamp(),
                    ..ResourceStatistics::default()
                }))
            }
        };

        let stats = self.inner.probe.usage(pid, true).await?;
        Ok(limits(stats))
    }

    /// Wait for a container's termination message.
    pub async fn wait(&self, id: &ContainerId) -> Result<Termination, Error> {
        let termination = self
            .lookup(id)
            .ok_or_else(|| Error::UnknownContainer(id.clone()))?
            .termination
            .clone();

        termination.wait().await.map_err(Error::Termination)
    }

    /// Destroy a container. Idempotent: destroys after the first are no-ops.
    pub async fn destroy(&self, id: &ContainerId) {
        self.destroy_with(id, true, None).await;
    }

    /// Live container ids.
    pub fn containers(&self) -> Vec<ContainerId> {
        self.inner
            .containers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ========================================================================
    // Launch pipeline
    // ========================================================================

    async fn launch_pipeline(
        &self,
        container: Arc<Container>,
        directory: PathBuf,
    ) -> Result<(), Error> {
        let id = container.id.clone();

        // FETCHING: place artifacts into the sandbox.
        let command = container.launch_command();
        if let Err(e) = self
            .inner
            .fetcher
            .fetch(&id, &command, &directory, container.user.as_deref())
            .await
        {
            // A killed fetch means a destroy won the race.
            if matches!(e, FetchError::Killed) {
                return Err(Error::Destroyed { container_id: id, stage: "fetching" });
            }
            return Err(e.into());
        }

        let container = self.reacquire(&id, "fetching")?;
        container.set_state(State::Pulling);

        // PULLING: cancellable through the stored token.
        let token = CancellationToken::new();
        *container.pull.write() = Some(token.clone());

        let image = container.docker_info.image.clone();
        let force = container.docker_info.force_pull_image;
        let pull_client = self.inner.docker.clone();
        tokio::select! {
            result = pull_client.pull(&image, force) => result?,
            _ = token.cancelled() => {
                return Err(Error::Destroyed { container_id: id, stage: "pulling image" });
            }
        }

        let container = self.reacquire(&id, "pulling image")?;
        *container.pull.write() = None;

        // RUNNING: issue `docker run`. Its completion is recorded on the
        // container but never awaited inline; a container legitimately lives
        // until something stops it.
        let options = self.run_options(&container, &directory);
        let run = container.run.clone();
        let run_client = self.inner.docker.clone();
        let run_name = container.name.clone();
        tokio::spawn(async move {
            let result = run_client.run(options).await.map_err(|e| e.to_string());
            if let Err(e) = &result {
                warn!("docker run for {} failed: {}", run_name, e);
            }
            run.set(result);
        });

        container.set_state(State::Running);

        // Launch the executor helper and arm its reaper.
        let nested = self.inner.config.nested_in_docker();
        let mut handle = if nested {
            executor::launch_nested(&self.inner.docker, &self.inner.config, &container, &directory)
                .await?
        } else {
            let handle = executor::launch_local(&self.inner.config, &container, &directory)?;
            *container.executor_pid.write() = Some(handle.pid);
            handle
        };

        if let Err(e) = self.finish_launch(&container, &mut handle).await {
            // The helper (or stand-in) is ours and unmonitored; reap it here
            // so the teardown's status wait cannot hang.
            let _ = handle.child.kill().await;
            container.status.set(None);
            return Err(e);
        }

        let status = container.status.clone();
        let this = self.clone();
        let reaped_id = id.clone();
        tokio::spawn(async move {
            let code = reaper::reap_child(handle.child).await;
            debug!("Executor for container {} exited with status {:?}", reaped_id, code);
            status.set(code);
            this.destroy_with(&reaped_id, false, None).await;
        });

        info!("Container {} is running", id);
        Ok(())
    }

    /// Checkpoint the helper pid, complete the handshake, and re-check that
    /// no destroy raced the executor launch.
    async fn finish_launch(
        &self,
        container: &Arc<Container>,
        handle: &mut executor::ExecutorHandle,
    ) -> Result<(), Error> {
        if container.checkpoint {
            let path = checkpoint::forked_pid_path(
                &self.inner.config.agent.work_dir,
                &container.slave_id,
                &container.executor.framework_id,
                &container.executor.executor_id,
                &container.id,
            );
            checkpoint::write_forked_pid(&path, handle.pid).await?;
            debug!("Checkpointed executor pid {} for container {}", handle.pid, container.id);
        }

        if handle.child.stdin.is_some() {
            executor::handshake(&mut handle.child).await?;
        }

        self.reacquire(&container.id, "launching the executor")?;
        Ok(())
    }

    /// Build the `docker run` invocation for a container.
    fn run_options(&self, container: &Container, directory: &PathBuf) -> RunOptions {
        let command = container.launch_command();
        let argv = if !command.arguments.is_empty() {
            let mut argv = vec![command.value.clone()];
            argv.extend(command.arguments.iter().cloned());
            argv
        } else if command.value.is_empty() {
            Vec::new()
        } else {
            shell_words::split(&command.value).unwrap_or_else(|_| vec![command.value.clone()])
        };

        let mut env = command.environment.clone();
        env.insert(
            "MESOS_SANDBOX".into(),
            self.inner.config.docker.sandbox_directory.display().to_string(),
        );

        let resources = *container.resources.read();

        RunOptions {
            name: container.name.clone(),
            image: container.docker_info.image.clone(),
            command: argv,
            env,
            volumes: vec![Volume {
                host_path: directory.clone(),
                container_path: self.inner.config.docker.sandbox_directory.clone(),
                read_only: false,
            }],
            network: container.docker_info.network,
            privileged: container.docker_info.privileged,
            parameters: container.docker_info.parameters.clone(),
            cpu_shares: resources.cpus.map(cgroups::cpu_shares),
            memory_bytes: resources
                .mem_bytes
                .map(|mem| mem.max(cgroups::MIN_MEMORY_BYTES)),
            stdout: Some(directory.join("stdout")),
            stderr: Some(directory.join("stderr")),
        }
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Drive a container into DESTROYING and through teardown.
    ///
    /// `reason`, when present, is the originating failure message and takes
    /// precedence over the stock termination messages.
    pub(crate) async fn destroy_with(
        &self,
        id: &ContainerId,
        killed: bool,
        reason: Option<String>,
    ) {
        let container = match self.lookup(id) {
            Some(container) => container,
            None => {
                debug!("Ignoring destroy of unknown container {}", id);
                return;
            }
        };

        let previous = match container.claim_destroy() {
            Some(previous) => previous,
            None => {
                debug!("Destroy of container {} already in progress", id);
                return;
            }
        };

        info!("Destroying container {} (was {})", id, previous);

        match previous {
            State::Fetching => {
                self.inner.fetcher.kill(id);
                self.terminate(
                    &container,
                    Ok(Termination {
                        killed,
                        status: None,
                        message: reason
                            .unwrap_or_else(|| "Container destroyed while fetching".into()),
                    }),
                );
            }
            State::Pulling => {
                if let Some(token) = container.pull.write().take() {
                    token.cancel();
                }
                self.terminate(
                    &container,
                    Ok(Termination {
                        killed,
                        status: None,
                        message: reason
                            .unwrap_or_else(|| "Container destroyed while pulling image".into()),
                    }),
                );
            }
            State::Running => {
                self.teardown_running(&container, killed, reason).await;
            }
            State::Destroying => unreachable!("claim_destroy returned DESTROYING"),
        }
    }

    /// Teardown for a container that made it past `docker run`.
    async fn teardown_running(
        &self,
        container: &Arc<Container>,
        killed: bool,
        reason: Option<String>,
    ) {
        let docker = &self.inner.docker;

        // A run that already failed means there is nothing left to stop.
        if let Some(Err(run_error)) = container.run.peek() {
            self.terminate(
                container,
                Ok(Termination {
                    killed,
                    status: None,
                    message: reason
                        .unwrap_or_else(|| format!("Failed to run container: {}", run_error)),
                }),
            );
            self.schedule_removal(container);
            return;
        }

        // Stop the executor helper container first (a no-op when there is
        // none) and signal the local helper tree; the helper may already be
        // gone, so both failures are swallowed.
        if let Err(e) = docker.stop(&container.executor_name, Duration::ZERO).await {
            debug!("Ignoring stop of executor container {}: {}", container.executor_name, e);
        }

        if let Some(pid) = *container.executor_pid.read() {
            match nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            ) {
                Ok(()) => debug!("Sent SIGTERM to executor process group {}", pid),
                Err(e) => debug!("Ignoring kill of executor process group {}: {}", pid, e),
            }
        }

        // The reaper's verdict on the executor.
        let status = container.status.wait().await;

        match docker
            .stop(&container.name, self.inner.config.docker.stop_timeout())
            .await
        {
            Ok(()) => {
                let message = reason.unwrap_or_else(|| {
                    if killed {
                        "Container killed".into()
                    } else {
                        "Container terminated".into()
                    }
                });
                self.terminate(container, Ok(Termination { killed, status, message }));
            }
            Err(e) => {
                // The container may still be running here; the stop is not
                // retried. The delayed removal below is scheduled regardless.
                warn!("Failed to stop container {}: {}", container.name, e);
                self.terminate(
                    container,
                    Err(format!("Failed to stop container {}: {}", container.name, e)),
                );
            }
        }

        self.schedule_removal(container);
    }

    /// Fulfil the termination promise and remove the record. Removal is only
    /// ever reached through here, after the promise is set.
    fn terminate(&self, container: &Arc<Container>, termination: Result<Termination, String>) {
        container.termination.set(termination);
        self.inner.containers.remove(&container.id);
        info!("Container {} is terminated", container.id);
    }

    /// Force-remove both Docker containers after the configured delay.
    fn schedule_removal(&self, container: &Arc<Container>) {
        let delay = self.inner.config.docker.remove_delay();
        let docker = self.inner.docker.clone();
        let name = container.name.clone();
        let executor_name = container.executor_name.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for target in [name, executor_name] {
                if let Err(e) = docker.rm(&target, true).await {
                    debug!("Ignoring removal of container {}: {}", target, e);
                }
            }
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lookup(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.inner.containers.get(id).map(|entry| entry.value().clone())
    }

    /// Re-acquire a container after an await. A missing record or one
    /// already in DESTROYING means a destroy won the race.
    fn reacquire(&self, id: &ContainerId, stage: &'static str) -> Result<Arc<Container>, Error> {
        let destroyed = || Error::Destroyed { container_id: id.clone(), stage };

        let container = self.lookup(id).ok_or_else(destroyed)?;
        if container.state() == State::Destroying {
            return Err(destroyed());
        }
        Ok(container)
    }

    pub(crate) fn insert(&self, container: Arc<Container>) {
        self.inner.containers.insert(container.id.clone(), container);
    }

    pub(crate) fn config_ref(&self) -> &Configuration {
        &self.inner.config
    }

    pub(crate) fn docker_client(&self) -> &Arc<dyn DockerClient> {
        &self.inner.docker
    }

    /// The container's init pid, cached or resolved through `docker inspect`.
    async fn resolve_pid(&self, container: &Arc<Container>) -> Result<Option<i32>, Error> {
        if let Some(pid) = *container.pid.read() {
            return Ok(Some(pid));
        }

        let details = self.inner.docker.inspect(&container.name).await?;
        let pid = details.and_then(|details| details.pid);

        if let Some(pid) = pid {
            *container.pid.write() = Some(pid);
        }
        Ok(pid)
    }

    /// Translate a resource allocation into cgroup writes against the pid's
    /// `cpu` and `memory` cgroups. A subsystem the pid is not a member of is
    /// skipped with a warning rather than failing the update.
    #[cfg(target_os = "linux")]
    async fn update_cgroups(
        &self,
        container: &Arc<Container>,
        resources: &Resources,
    ) -> Result<(), Error> {
        let pid = match self.resolve_pid(container).await? {
            Some(pid) => pid,
            None => {
                debug!("Container {} has no known pid yet, skipping update", container.id);
                return Ok(());
            }
        };

        if let Some(cpus) = resources.cpus {
            let hierarchy = cgroups::hierarchy("cpu")?;
            match cgroups::cgroup_of("cpu", pid)? {
                Some(cgroup) => {
                    let shares = cgroups::apply_cpu(&hierarchy, &cgroup, cpus)?;
                    info!(
                        "Updated cpu.shares to {} for container {} at {}",
                        shares, container.id, cgroup
                    );
                }
                None => {
                    warn!(
                        "Pid {} is not a member of the cpu subsystem, skipping the cpu update",
                        pid
                    );
                }
            }
        }

        if let Some(mem) = resources.mem_bytes {
            let hierarchy = cgroups::hierarchy("memory")?;
            match cgroups::cgroup_of("memory", pid)? {
                Some(cgroup) => {
                    let limit = cgroups::apply_memory(&hierarchy, &cgroup, mem)?;
                    info!(
                        "Updated memory limits to {} bytes for container {} at {}",
                        limit, container.id, cgroup
                    );
                }
                None => {
                    warn!(
                        "Pid {} is not a member of the memory subsystem, skipping the memory update",
                        pid
                    );
                }
            }
        }

        Ok(())
    }
}
