//! Per-container record
//!
//! One [`Container`] exists per live ContainerId. The record is created by
//! `launch` (or re-created by `recover`), mutated only by the engine, and
//! removed by `destroy` after its termination promise is fulfilled.

use std::path::PathBuf;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::docker::name;
use crate::sync::Promise;
use crate::types::{
    CommandInfo, ContainerId, DockerInfo, ExecutorInfo, Resources, SlaveId, TaskInfo, Termination,
};

use super::Launch;

/// Lifecycle state of a container.
///
/// Transitions only move forward; FETCHING and PULLING may jump straight to
/// DESTROYING when a destroy races the launch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Fetching,
    Pulling,
    Running,
    Destroying,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Fetching => write!(f, "fetching"),
            State::Pulling => write!(f, "pulling"),
            State::Running => write!(f, "running"),
            State::Destroying => write!(f, "destroying"),
        }
    }
}

/// Everything the engine tracks for one container.
pub struct Container {
    /// Caller-supplied identifier
    pub id: ContainerId,

    /// Docker name of the workload container
    pub name: String,

    /// Docker name of the executor helper container (nested-in-Docker mode)
    pub executor_name: String,

    /// Lifecycle state; written only while holding the registry entry
    pub state: RwLock<State>,

    /// Task wrapped by this container, when there is one
    pub task: Option<TaskInfo>,

    /// Executor description
    pub executor: ExecutorInfo,

    /// Docker-specific settings extracted from the container info
    pub docker_info: DockerInfo,

    /// Effective sandbox path; unknown for containers re-created by recovery
    pub directory: Option<PathBuf>,

    /// Whether the sandbox path is a symlink standing in for a colon path
    pub symlinked: bool,

    /// Run-as user for sandbox ownership
    pub user: Option<String>,

    /// Agent identity forwarded to the executor
    pub slave_id: SlaveId,
    pub slave_pid: String,

    /// Whether the forked helper pid is checkpointed
    pub checkpoint: bool,

    /// Last applied resource allocation
    pub resources: RwLock<Resources>,

    /// Pid of the container's init process, cached once known
    pub pid: RwLock<Option<i32>>,

    /// Pid of the locally forked helper; unset on the nested-in-Docker path
    pub executor_pid: RwLock<Option<i32>>,

    /// Cancellation handle for an in-flight image pull
    pub pull: RwLock<Option<CancellationToken>>,

    /// Completion of `docker run`: exit code, or the failure message
    pub run: Promise<Result<i64, String>>,

    /// Raw wait status delivered by the reaper; `None` when unobservable
    pub status: Promise<Option<i32>>,

    /// Termination message, fulfilled exactly once at destruction
    pub termination: Promise<Result<Termination, String>>,
}

impl Container {
    /// Record for a fresh launch. The sandbox has already been prepared.
    pub fn new(launch: Launch, docker_info: DockerInfo, directory: PathBuf, symlinked: bool) -> Self {
        let resources = match &launch.task {
            Some(task) => task.resources,
            None => launch.executor.resources,
        };

        Self {
            name: name::container_name(&launch.slave_id, &launch.container_id),
            executor_name: name::executor_name(&launch.slave_id, &launch.container_id),
            id: launch.container_id,
            state: RwLock::new(State::Fetching),
            task: launch.task,
            executor: launch.executor,
            docker_info,
            directory: Some(directory),
            symlinked,
            user: launch.user,
            slave_id: launch.slave_id,
            slave_pid: launch.slave_pid,
            checkpoint: launch.checkpoint,
            resources: RwLock::new(resources),
            pid: RwLock::new(None),
            executor_pid: RwLock::new(None),
            pull: RwLock::new(None),
            run: Promise::new(),
            status: Promise::new(),
            termination: Promise::new(),
        }
    }

    /// Record re-created during recovery. Only identity, names and the
    /// (possibly still live) helper pid survive an agent restart.
    pub fn recovered(
        id: ContainerId,
        slave_id: SlaveId,
        container_name: String,
        executor_name: String,
        executor_pid: Option<i32>,
    ) -> Self {
        Self {
            id,
            name: container_name,
            executor_name,
            state: RwLock::new(State::Running),
            task: None,
            executor: ExecutorInfo::default(),
            docker_info: DockerInfo::default(),
            directory: None,
            symlinked: false,
            user: None,
            slave_id,
            slave_pid: String::new(),
            checkpoint: false,
            resources: RwLock::new(Resources::default()),
            pid: RwLock::new(None),
            executor_pid: RwLock::new(executor_pid),
            pull: RwLock::new(None),
            run: Promise::new(),
            status: Promise::new(),
            termination: Promise::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.state.read()
    }

    /// Move to a new state.
    pub fn set_state(&self, state: State) {
        *self.state.write() = state;
    }

    /// Claim the one-and-only transition into DESTROYING.
    ///
    /// Returns the state the container was in, or `None` when another
    /// destroy already claimed it.
    pub fn claim_destroy(&self) -> Option<State> {
        let mut state = self.state.write();
        if *state == State::Destroying {
            None
        } else {
            let previous = *state;
            *state = State::Destroying;
            Some(previous)
        }
    }

    /// The command the container runs: the task's when wrapping a task,
    /// otherwise the executor's.
    pub fn launch_command(&self) -> CommandInfo {
        self.task
            .as_ref()
            .and_then(|task| task.command.clone())
            .unwrap_or_else(|| self.executor.command.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContainerKind;

    fn launch() -> Launch {
        Launch {
            container_id: ContainerId::from("c1"),
            task: None,
            executor: ExecutorInfo {
                executor_id: "ex1".into(),
                framework_id: "fw1".into(),
                container: Some(crate::types::ContainerInfo::docker("busybox")),
                ..ExecutorInfo::default()
            },
            directory: PathBuf::from("/tmp/sandbox"),
            user: None,
            slave_id: SlaveId::from("s1"),
            slave_pid: "slave(1)@127.0.0.1:5051".into(),
            checkpoint: false,
        }
    }

    #[test]
    fn test_new_container_names() {
        let l = launch();
        let docker_info = l.executor.container.clone().unwrap().docker.unwrap();
        let container = Container::new(l, docker_info, PathBuf::from("/tmp/sandbox"), false);

        assert_eq!(container.name, "mesos-s1.c1");
        assert_eq!(container.executor_name, "mesos-s1.c1.executor");
        assert_eq!(container.state(), State::Fetching);
        assert_eq!(
            container.executor.container.as_ref().unwrap().kind,
            ContainerKind::Docker
        );
    }

    #[test]
    fn test_claim_destroy_once() {
        let l = launch();
        let docker_info = l.executor.container.clone().unwrap().docker.unwrap();
        let container = Container::new(l, docker_info, PathBuf::from("/tmp/sandbox"), false);

        assert_eq!(container.claim_destroy(), Some(State::Fetching));
        assert_eq!(container.claim_destroy(), None);
        assert_eq!(container.state(), State::Destroying);
    }

    #[test]
    fn test_task_resources_win() {
        let mut l = launch();
        l.task = Some(TaskInfo {
            task_id: "t1".into(),
            resources: Resources { cpus: Some(2.0), mem_bytes: Some(1024) },
            ..TaskInfo::default()
        });
        let docker_info = l.executor.container.clone().unwrap().docker.unwrap();
        let container = Container::new(l, docker_info, PathBuf::from("/tmp/sandbox"), false);

        assert_eq!(container.resources.read().cpus, Some(2.0));
    }
}
