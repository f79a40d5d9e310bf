//! End-to-end scenarios for the containerizer engine, driven by scripted
//! Docker and fetcher doubles plus a stub executor helper binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use docker_containerizer::checkpoint::{
    self, ExecutorState, FrameworkState, RunState, SlaveState,
};
use docker_containerizer::config::Configuration;
use docker_containerizer::containerizer::{Containerizer, Error, Launch};
use docker_containerizer::docker::{
    ContainerDetails, DockerClient, DockerResult, RunOptions,
};
use docker_containerizer::fetcher::{FetchError, Fetcher};
use docker_containerizer::probe::{ProbeError, ResourceProbe};
use docker_containerizer::types::{
    CommandInfo, ContainerId, ContainerInfo, ContainerKind, ExecutorInfo, Resources,
    ResourceStatistics, SlaveId, TaskInfo,
};

// ============================================================================
// Doubles
// ============================================================================

#[derive(Default)]
struct MockDocker {
    calls: Mutex<Vec<String>>,
    runs: Mutex<Vec<RunOptions>>,
    ps_names: Mutex<Vec<String>>,
    inspect_pid: Mutex<Option<i32>>,
    inspect_calls: AtomicUsize,
    pull_started: Notify,
    pull_blocks: AtomicBool,
}

impl MockDocker {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DockerClient for MockDocker {
    async fn pull(&self, image: &str, _force: bool) -> DockerResult<()> {
        self.record(format!("pull {}", image));
        self.pull_started.notify_one();
        if self.pull_blocks.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn run(&self, options: RunOptions) -> DockerResult<i64> {
        self.record(format!("run {}", options.name));
        self.runs.lock().push(options);
        // A healthy container lives until something stops it.
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn stop(&self, name: &str, timeout: Duration) -> DockerResult<()> {
        self.record(format!("stop {} {}", name, timeout.as_secs()));
        Ok(())
    }

    async fn rm(&self, name: &str, force: bool) -> DockerResult<()> {
        self.record(format!("rm {} {}", name, force));
        Ok(())
    }

    async fn inspect(&self, name: &str) -> DockerResult<Option<ContainerDetails>> {
        self.record(format!("inspect {}", name));
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        let pid = *self.inspect_pid.lock();
        Ok(pid.map(|pid| ContainerDetails {
            id: "cafebabe".into(),
            name: name.trim_start_matches('/').to_string(),
            pid: Some(pid),
            running: true,
        }))
    }

    async fn ps(&self, _all: bool, _name_filter: &str) -> DockerResult<Vec<String>> {
        self.record("ps");
        Ok(self.ps_names.lock().clone())
    }

    async fn logs(&self, name: &str, _directory: &Path) -> DockerResult<()> {
        self.record(format!("logs {}", name));
        Ok(())
    }

    async fn wait(&self, name: &str) -> DockerResult<i64> {
        self.record(format!("wait {}", name));
        Ok(0)
    }
}

#[derive(Default)]
struct MockFetcher {
    calls: Mutex<Vec<ContainerId>>,
    started: Notify,
    blocks: AtomicBool,
    killed: Mutex<HashMap<ContainerId, tokio_util::sync::CancellationToken>>,
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        container_id: &ContainerId,
        _command: &CommandInfo,
        _directory: &Path,
        _user: Option<&str>,
    ) -> Result<(), FetchError> {
        self.calls.lock().push(container_id.clone());

        let token = tokio_util::sync::CancellationToken::new();
        self.killed.lock().insert(container_id.clone(), token.clone());
        self.started.notify_one();

        if self.blocks.load(Ordering::SeqCst) {
            token.cancelled().await;
            return Err(FetchError::Killed);
        }
        Ok(())
    }

    fn kill(&self, container_id: &ContainerId) {
        if let Some(token) = self.killed.lock().remove(container_id) {
            token.cancel();
        }
    }
}

struct StubProbe;

#[async_trait]
impl ResourceProbe for StubProbe {
    async fn usage(
        &self,
        _pid: i32,
        _include_children: bool,
    ) -> Result<ResourceStatistics, ProbeError> {
        Ok(ResourceStatistics {
            timestamp: 1.0,
            cpus_user_time_secs: Some(0.5),
            cpus_system_time_secs: Some(0.25),
            mem_rss_bytes: Some(4096),
            ..ResourceStatistics::default()
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    containerizer: Containerizer,
    docker: Arc<MockDocker>,
    fetcher: Arc<MockFetcher>,
    work: tempfile::TempDir,
    _launcher: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut Configuration)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let work = tempfile::tempdir().unwrap();
        let launcher = tempfile::tempdir().unwrap();
        write_stub_helper(launcher.path());

        let mut config = Configuration::default();
        config.agent.work_dir = work.path().to_path_buf();
        config.agent.launcher_dir = launcher.path().to_path_buf();
        config.docker.stop_timeout_secs = 3;
        config.docker.remove_delay_secs = 0;
        adjust(&mut config);

        let docker = Arc::new(MockDocker::default());
        let fetcher = Arc::new(MockFetcher::default());
        let containerizer = Containerizer::new(
            config,
            docker.clone(),
            fetcher.clone(),
            Arc::new(StubProbe),
        );

        Self { containerizer, docker, fetcher, work, _launcher: launcher }
    }
}

/// A stand-in for `mesos-docker-executor`: consumes the handshake byte and
/// then lives until it is signalled.
fn write_stub_helper(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("mesos-docker-executor");
    std::fs::write(&path, "#!/bin/sh\nread handshake\nexec sleep 600\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn docker_executor() -> ExecutorInfo {
    ExecutorInfo {
        executor_id: "ex1".into(),
        framework_id: "fw1".into(),
        command: CommandInfo { value: "echo hello".into(), ..CommandInfo::default() },
        container: Some(ContainerInfo::docker("busybox")),
        resources: Resources { cpus: Some(1.0), mem_bytes: Some(64 * 1024 * 1024) },
    }
}

fn docker_launch(id: &str, directory: &Path) -> Launch {
    Launch {
        container_id: ContainerId::from(id),
        task: None,
        executor: docker_executor(),
        directory: directory.to_path_buf(),
        user: None,
        slave_id: SlaveId::from("s1"),
        slave_pid: "slave(1)@127.0.0.1:5051".into(),
        checkpoint: true,
    }
}

fn dead_pid() -> i32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();
    pid
}

fn slave_state(runs: Vec<(&str, Option<i32>, bool)>) -> SlaveState {
    let executors = runs
        .into_iter()
        .enumerate()
        .map(|(i, (id, forked_pid, completed))| {
            let container_id = ContainerId::from(id);
            let mut run_map = HashMap::new();
            run_map.insert(
                container_id.clone(),
                RunState { id: container_id.clone(), forked_pid, completed, directory: None },
            );
            ExecutorState {
                id: format!("ex{}", i),
                latest: Some(container_id),
                runs: run_map,
            }
        })
        .collect();

    SlaveState {
        id: SlaveId::from("s1"),
        frameworks: vec![FrameworkState { id: "fw1".into(), executors }],
    }
}

// ============================================================================
// Launch scenarios
// ============================================================================

#[tokio::test]
async fn test_launch_declines_non_docker_container() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();

    let mut launch = docker_launch("a", sandbox.path());
    launch.executor.container = Some(ContainerInfo { kind: ContainerKind::Mesos, docker: None });

    let launched = fixture.containerizer.launch(launch).await.unwrap();
    assert!(!launched);
    assert!(fixture.containerizer.containers().is_empty());
    assert!(fixture.docker.calls().is_empty());
}

#[tokio::test]
async fn test_launch_declines_missing_container_info() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();

    let mut launch = docker_launch("a", sandbox.path());
    launch.executor.container = None;

    assert!(!fixture.containerizer.launch(launch).await.unwrap());
}

#[tokio::test]
async fn test_launch_runs_container() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();

    let launched = fixture
        .containerizer
        .launch(docker_launch("c1", sandbox.path()))
        .await
        .unwrap();
    assert!(launched);

    let ids = fixture.containerizer.containers();
    assert_eq!(ids, vec![ContainerId::from("c1")]);

    // Fetch happened, image was pulled, docker run was issued with the
    // expected name, sandbox volume and resource flags.
    assert_eq!(fixture.fetcher.calls.lock().clone(), vec![ContainerId::from("c1")]);

    let calls = fixture.docker.calls();
    assert!(calls.contains(&"pull busybox".to_string()));
    assert!(calls.contains(&"run mesos-s1.c1".to_string()));

    let runs = fixture.docker.runs.lock();
    let options = &runs[0];
    assert_eq!(options.image, "busybox");
    assert_eq!(options.command, vec!["echo", "hello"]);
    assert_eq!(options.volumes[0].host_path, sandbox.path());
    assert_eq!(options.cpu_shares, Some(1024));
    assert_eq!(options.memory_bytes, Some(64 * 1024 * 1024));
    drop(runs);

    // The helper pid was checkpointed.
    let pid_path = checkpoint::forked_pid_path(
        fixture.work.path(),
        &SlaveId::from("s1"),
        "fw1",
        "ex1",
        &ContainerId::from("c1"),
    );
    let pid = checkpoint::read_forked_pid(&pid_path).await.unwrap();
    assert!(pid.is_some());

    // No termination yet: the container is running.
    let containerizer = fixture.containerizer.clone();
    let pending = tokio::time::timeout(
        Duration::from_millis(100),
        containerizer.wait(&ContainerId::from("c1")),
    )
    .await;
    assert!(pending.is_err());

    // Cleanup so the stub helper does not outlive the test.
    fixture.containerizer.destroy(&ContainerId::from("c1")).await;
}

#[tokio::test]
async fn test_launch_duplicate_id_fails() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();

    assert!(fixture
        .containerizer
        .launch(docker_launch("c1", sandbox.path()))
        .await
        .unwrap());

    let err = fixture
        .containerizer
        .launch(docker_launch("c1", sandbox.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyLaunched(_)));

    fixture.containerizer.destroy(&ContainerId::from("c1")).await;
}

#[tokio::test]
async fn test_colon_sandbox_is_symlinked() {
    let fixture = Fixture::new();
    let parent = tempfile::tempdir().unwrap();
    let colon_dir = parent.path().join("x:y");
    std::fs::create_dir_all(&colon_dir).unwrap();

    assert!(fixture
        .containerizer
        .launch(docker_launch("b", &colon_dir))
        .await
        .unwrap());

    let link: PathBuf = fixture
        .work
        .path()
        .join("s1")
        .join("docker")
        .join("links")
        .join("b");
    assert_eq!(std::fs::read_link(&link).unwrap(), colon_dir);

    // Docker mounts the link, not the colon path.
    let runs = fixture.docker.runs.lock();
    assert_eq!(runs[0].volumes[0].host_path, link);
    drop(runs);

    fixture.containerizer.destroy(&ContainerId::from("b")).await;
}

#[tokio::test]
async fn test_task_command_wins_over_executor_command() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();

    let mut launch = docker_launch("t1", sandbox.path());
    launch.task = Some(TaskInfo {
        task_id: "task-1".into(),
        command: Some(CommandInfo { value: "sleep 30".into(), ..CommandInfo::default() }),
        container: Some(ContainerInfo::docker("alpine")),
        resources: Resources { cpus: Some(2.0), mem_bytes: None },
    });

    assert!(fixture.containerizer.launch(launch).await.unwrap());

    let runs = fixture.docker.runs.lock();
    assert_eq!(runs[0].image, "alpine");
    assert_eq!(runs[0].command, vec!["sleep", "30"]);
    assert_eq!(runs[0].cpu_shares, Some(2048));
    drop(runs);

    fixture.containerizer.destroy(&ContainerId::from("t1")).await;
}

// ============================================================================
// Destroy scenarios
// ============================================================================

#[tokio::test]
async fn test_destroy_running_container() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("c1");

    assert!(fixture
        .containerizer
        .launch(docker_launch("c1", sandbox.path()))
        .await
        .unwrap());

    let waiter = {
        let containerizer = fixture.containerizer.clone();
        let id = id.clone();
        tokio::spawn(async move { containerizer.wait(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    fixture.containerizer.destroy(&id).await;

    let termination = waiter.await.unwrap().unwrap();
    assert!(termination.killed);
    assert_eq!(termination.message, "Container killed");
    // The stub helper dies of SIGTERM, which the reaper reports.
    assert_eq!(termination.status, Some(libc_sigterm_status()));

    assert!(fixture.containerizer.containers().is_empty());

    // Helper container stopped with no grace, workload with the configured
    // grace period; both removals scheduled (delay is zero in tests).
    let calls = fixture.docker.calls();
    assert!(calls.contains(&"stop mesos-s1.c1.executor 0".to_string()));
    assert!(calls.contains(&"stop mesos-s1.c1 3".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = fixture.docker.calls();
    assert!(calls.contains(&"rm mesos-s1.c1 true".to_string()));
    assert!(calls.contains(&"rm mesos-s1.c1.executor true".to_string()));
}

fn libc_sigterm_status() -> i32 {
    // Raw wait status of a process terminated by SIGTERM.
    15
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("c1");

    assert!(fixture
        .containerizer
        .launch(docker_launch("c1", sandbox.path()))
        .await
        .unwrap());

    fixture.containerizer.destroy(&id).await;
    let stops = fixture
        .docker
        .calls()
        .iter()
        .filter(|call| call.starts_with("stop mesos-s1.c1 "))
        .count();

    fixture.containerizer.destroy(&id).await;
    let stops_after = fixture
        .docker
        .calls()
        .iter()
        .filter(|call| call.starts_with("stop mesos-s1.c1 "))
        .count();

    assert_eq!(stops, 1);
    assert_eq!(stops_after, 1);
}

#[tokio::test]
async fn test_destroy_while_pulling_discards_pull() {
    let fixture = Fixture::new();
    fixture.docker.pull_blocks.store(true, Ordering::SeqCst);

    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("c");

    let launcher = {
        let containerizer = fixture.containerizer.clone();
        let launch = docker_launch("c", sandbox.path());
        tokio::spawn(async move { containerizer.launch(launch).await })
    };

    fixture.docker.pull_started.notified().await;

    let waiter = {
        let containerizer = fixture.containerizer.clone();
        let id = id.clone();
        tokio::spawn(async move { containerizer.wait(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    fixture.containerizer.destroy(&id).await;

    let termination = waiter.await.unwrap().unwrap();
    assert!(termination.killed);
    assert_eq!(termination.message, "Container destroyed while pulling image");
    assert_eq!(termination.status, None);

    // The launch pipeline observed the race and failed.
    assert!(matches!(
        launcher.await.unwrap(),
        Err(Error::Destroyed { .. })
    ));

    // No `docker run` was ever issued.
    assert!(fixture.containerizer.containers().is_empty());
    assert!(fixture.docker.runs.lock().is_empty());
}

#[tokio::test]
async fn test_destroy_while_fetching_kills_fetch() {
    let fixture = Fixture::new();
    fixture.fetcher.blocks.store(true, Ordering::SeqCst);

    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("f");

    let launcher = {
        let containerizer = fixture.containerizer.clone();
        let launch = docker_launch("f", sandbox.path());
        tokio::spawn(async move { containerizer.launch(launch).await })
    };

    fixture.fetcher.started.notified().await;

    let waiter = {
        let containerizer = fixture.containerizer.clone();
        let id = id.clone();
        tokio::spawn(async move { containerizer.wait(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    fixture.containerizer.destroy(&id).await;

    let termination = waiter.await.unwrap().unwrap();
    assert_eq!(termination.message, "Container destroyed while fetching");

    assert!(matches!(
        launcher.await.unwrap(),
        Err(Error::Destroyed { .. })
    ));
    assert!(fixture.containerizer.containers().is_empty());
    // Neither a pull nor a run ever happened.
    assert!(fixture.docker.calls().is_empty());
}

// ============================================================================
// Update and usage
// ============================================================================

#[tokio::test]
async fn test_update_unknown_container_is_noop() {
    let fixture = Fixture::new();
    fixture
        .containerizer
        .update(&ContainerId::from("ghost"), Resources { cpus: Some(1.0), mem_bytes: None })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_identical_resources_short_circuits() {
    let fixture = Fixture::new();
    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("u1");

    assert!(fixture
        .containerizer
        .launch(docker_launch("u1", sandbox.path()))
        .await
        .unwrap());

    // Pid resolution finds nothing, so no cgroup work happens; the request
    // is still recorded as applied.
    let resources = Resources { cpus: Some(3.0), mem_bytes: Some(512 * 1024 * 1024) };
    fixture.containerizer.update(&id, resources).await.unwrap();
    let inspects = fixture.docker.inspect_calls.load(Ordering::SeqCst);
    assert_eq!(inspects, 1);

    // An identical request stops at the identity check.
    fixture.containerizer.update(&id, resources).await.unwrap();
    assert_eq!(fixture.docker.inspect_calls.load(Ordering::SeqCst), 1);

    fixture.containerizer.destroy(&id).await;
}

#[tokio::test]
async fn test_nested_launch_update_and_usage() {
    let fake_docker_dir = tempfile::tempdir().unwrap();
    let fake_docker = write_fake_docker(fake_docker_dir.path());

    let fixture = Fixture::with_config(|config| {
        config.docker.mesos_image = Some("mesos/agent".into());
        config.docker.binary = fake_docker;
    });

    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("n1");

    assert!(fixture
        .containerizer
        .launch(docker_launch("n1", sandbox.path()))
        .await
        .unwrap());

    // Both the workload container and the helper container were started; the
    // helper carries the agent image, the read-only socket mount and the
    // read-write sandbox mount.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let runs = fixture.docker.runs.lock().clone();
    let helper = runs
        .iter()
        .find(|options| options.name == "mesos-s1.n1.executor")
        .expect("helper container run");
    assert_eq!(helper.image, "mesos/agent");
    assert!(helper.volumes.iter().any(|volume| volume.read_only));
    assert!(helper.volumes.iter().any(|volume| !volume.read_only));
    assert!(runs.iter().any(|options| options.name == "mesos-s1.n1"));

    // Updates are a no-op while nested: no inspect, no cgroup work.
    fixture
        .containerizer
        .update(&id, Resources { cpus: Some(4.0), mem_bytes: None })
        .await
        .unwrap();
    assert_eq!(fixture.docker.inspect_calls.load(Ordering::SeqCst), 0);

    // Usage reports empty statistics while nested.
    let stats = fixture.containerizer.usage(&id).await.unwrap();
    assert!(stats.timestamp > 0.0);
    assert_eq!(stats.cpus_user_time_secs, None);
    assert_eq!(stats.mem_rss_bytes, None);

    fixture.containerizer.destroy(&id).await;
}

#[tokio::test]
async fn test_usage_unknown_container_fails() {
    let fixture = Fixture::new();
    assert!(matches!(
        fixture.containerizer.usage(&ContainerId::from("ghost")).await,
        Err(Error::UnknownContainer(_))
    ));
}

#[tokio::test]
async fn test_usage_attaches_declared_limits() {
    let fixture = Fixture::new();
    fixture.docker.inspect_pid.lock().replace(4711);

    let sandbox = tempfile::tempdir().unwrap();
    let id = ContainerId::from("u2");

    assert!(fixture
        .containerizer
        .launch(docker_launch("u2", sandbox.path()))
        .await
        .unwrap());

    let stats = fixture.containerizer.usage(&id).await.unwrap();
    assert_eq!(stats.cpus_user_time_secs, Some(0.5));
    assert_eq!(stats.mem_rss_bytes, Some(4096));
    // Limits come from the launch-declared resources.
    assert_eq!(stats.cpus_limit, Some(1.0));
    assert_eq!(stats.mem_limit_bytes, Some(64 * 1024 * 1024));

    fixture.containerizer.destroy(&id).await;
}

#[tokio::test]
async fn test_wait_unknown_container_fails() {
    let fixture = Fixture::new();
    assert!(matches!(
        fixture.containerizer.wait(&ContainerId::from("ghost")).await,
        Err(Error::UnknownContainer(_))
    ));
}

// ============================================================================
// Recovery scenarios
// ============================================================================

/// A fake `docker` binary whose `wait` subcommand blocks briefly, standing in
/// for a live helper container during recovery.
fn write_fake_docker(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("docker");
    std::fs::write(
        &path,
        "#!/bin/sh\nif [ \"$1\" = \"wait\" ]; then sleep 2; echo 0; fi\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn test_recover_reattaches_via_docker_wait() {
    let fake_docker_dir = tempfile::tempdir().unwrap();
    let fake_docker = write_fake_docker(fake_docker_dir.path());

    let fixture = Fixture::with_config(|config| {
        config.docker.binary = fake_docker;
    });

    fixture.docker.ps_names.lock().extend([
        "mesos-s1.c1".to_string(),
        "mesos-s1.c1.executor".to_string(),
    ]);

    // The checkpointed pid is dead, but the workload container and its
    // helper are both still alive.
    let sandbox = tempfile::tempdir().unwrap();
    let mut state = slave_state(vec![("c1", Some(dead_pid()), false)]);
    state.frameworks[0].executors[0]
        .runs
        .get_mut(&ContainerId::from("c1"))
        .unwrap()
        .directory = Some(sandbox.path().to_path_buf());

    fixture.containerizer.recover(Some(state)).await.unwrap();

    assert_eq!(fixture.containerizer.containers(), vec![ContainerId::from("c1")]);

    // Output capture resumes into the known sandbox, and a claimed
    // container is not treated as an orphan.
    let calls = fixture.docker.calls();
    assert!(calls.contains(&"logs mesos-s1.c1".to_string()));
    assert!(!calls.iter().any(|call| call.starts_with("stop")));
}

#[tokio::test]
async fn test_recover_skips_completed_and_uncheckpointed_runs() {
    let fixture = Fixture::new();

    fixture.docker.ps_names.lock().extend([
        "mesos-s1.done".to_string(),
        "mesos-s1.lost".to_string(),
    ]);

    let state = slave_state(vec![
        ("done", Some(dead_pid()), true),
        ("lost", None, false),
    ]);
    fixture.containerizer.recover(Some(state)).await.unwrap();

    assert!(fixture.containerizer.containers().is_empty());

    // Both leftovers get swept as orphans.
    let calls = fixture.docker.calls();
    assert!(calls.contains(&"stop mesos-s1.done 3".to_string()));
    assert!(calls.contains(&"stop mesos-s1.lost 3".to_string()));
    assert!(calls.contains(&"rm mesos-s1.done true".to_string()));
    assert!(calls.contains(&"rm mesos-s1.lost true".to_string()));
}

#[tokio::test]
async fn test_recover_rejects_duplicate_pids() {
    let fixture = Fixture::new();

    fixture.docker.ps_names.lock().extend([
        "mesos-s1.a".to_string(),
        "mesos-s1.b".to_string(),
    ]);

    let live_pid = std::process::id() as i32;
    let state = slave_state(vec![("a", Some(live_pid), false), ("b", Some(live_pid), false)]);

    assert!(matches!(
        fixture.containerizer.recover(Some(state)).await,
        Err(Error::DuplicatePid { .. })
    ));
}

#[tokio::test]
async fn test_recover_without_state_sweeps_orphans() {
    let fixture = Fixture::new();

    fixture.docker.ps_names.lock().extend([
        "mesos-s1.o1".to_string(),
        "mesos-s1.o2.executor".to_string(),
    ]);

    fixture.containerizer.recover(None).await.unwrap();

    let calls = fixture.docker.calls();
    assert!(calls.contains(&"stop mesos-s1.o1 3".to_string()));
    assert!(calls.contains(&"stop mesos-s1.o2.executor 3".to_string()));
}

#[tokio::test]
async fn test_recover_honours_kill_orphans_flag() {
    let fixture = Fixture::with_config(|config| {
        config.docker.kill_orphans = false;
    });

    fixture.docker.ps_names.lock().push("mesos-s1.o1".to_string());

    fixture.containerizer.recover(None).await.unwrap();

    let calls = fixture.docker.calls();
    assert!(!calls.iter().any(|call| call.starts_with("stop")));
}
