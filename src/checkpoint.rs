//! Persisted agent state and pid checkpointing
//!
//! The agent checkpoints the forked executor helper pid so a restarted agent
//! can reattach to containers it no longer parents. The layout under the
//! work directory is
//! `meta/slaves/<slaveId>/frameworks/<fw>/executors/<ex>/runs/<containerId>/pids/forked.pid`.
//! Recovery consumes a [`SlaveState`] snapshot of that tree, handed in by the
//! agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, SlaveId};

/// Error type for checkpoint I/O
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read checkpoint {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed pid in checkpoint {}: {value:?}", path.display())]
    Malformed { path: PathBuf, value: String },
}

/// Path of the forked-pid checkpoint file for one executor run.
pub fn forked_pid_path(
    work_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &str,
    executor_id: &str,
    container_id: &ContainerId,
) -> PathBuf {
    work_dir
        .join("meta")
        .join("slaves")
        .join(slave_id.as_str())
        .join("frameworks")
        .join(framework_id)
        .join("executors")
        .join(executor_id)
        .join("runs")
        .join(container_id.as_str())
        .join("pids")
        .join("forked.pid")
}

/// Persist a forked helper pid.
pub async fn write_forked_pid(path: &Path, pid: i32) -> Result<(), CheckpointError> {
    let map_err = |source| CheckpointError::Write { path: path.to_path_buf(), source };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
    }
    tokio::fs::write(path, pid.to_string()).await.map_err(map_err)
}

/// Read a forked helper pid. Returns `None` when the checkpoint is absent.
pub async fn read_forked_pid(path: &Path) -> Result<Option<i32>, CheckpointError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Read { path: path.to_path_buf(), source })
        }
    };

    let trimmed = content.trim();
    trimmed
        .parse::<i32>()
        .map(Some)
        .map_err(|_| CheckpointError::Malformed {
            path: path.to_path_buf(),
            value: trimmed.to_string(),
        })
}

/// Snapshot of the agent's persisted state, handed in for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveState {
    /// Agent identity
    pub id: SlaveId,

    /// Frameworks that had executors running on this agent
    #[serde(default)]
    pub frameworks: Vec<FrameworkState>,
}

/// Persisted state of one framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkState {
    pub id: String,

    #[serde(default)]
    pub executors: Vec<ExecutorState>,
}

/// Persisted state of one executor, possibly spanning multiple runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    pub id: String,

    /// Container id of the most recent run; only this run is recovered
    #[serde(default)]
    pub latest: Option<ContainerId>,

    #[serde(default)]
    pub runs: HashMap<ContainerId, RunState>,
}

impl ExecutorState {
    /// The most recent run, when one is recorded.
    pub fn latest_run(&self) -> Option<&RunState> {
        self.latest.as_ref().and_then(|id| self.runs.get(id))
    }
}

/// Persisted state of one executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: ContainerId,

    /// Checkpointed helper pid; absent when the agent died before the
    /// checkpoint was written
    #[serde(default)]
    pub forked_pid: Option<i32>,

    /// Whether the run was already marked complete
    #[serde(default)]
    pub completed: bool,

    /// Sandbox directory of the run, used to resume output capture
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forked_pid_path_layout() {
        let path = forked_pid_path(
            Path::new("/var/lib/agent"),
            &SlaveId::from("s1"),
            "fw1",
            "ex1",
            &ContainerId::from("c1"),
        );
        assert_eq!(
            path,
            Path::new(
                "/var/lib/agent/meta/slaves/s1/frameworks/fw1/executors/ex1/runs/c1/pids/forked.pid"
            )
        );
    }

    #[tokio::test]
    async fn test_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/c1/pids/forked.pid");

        assert_eq!(read_forked_pid(&path).await.unwrap(), None);

        write_forked_pid(&path, 4711).await.unwrap();
        assert_eq!(read_forked_pid(&path).await.unwrap(), Some(4711));
    }

    #[tokio::test]
    async fn test_malformed_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forked.pid");
        tokio::fs::write(&path, "not-a-pid").await.unwrap();

        assert!(matches!(
            read_forked_pid(&path).await,
            Err(CheckpointError::Malformed { .. })
        ));
    }

    #[test]
    fn test_latest_run() {
        let run = RunState {
            id: ContainerId::from("c2"),
            forked_pid: Some(7),
            completed: false,
            directory: None,
        };

        let mut runs = HashMap::new();
        runs.insert(ContainerId::from("c2"), run);

        let executor = ExecutorState {
            id: "ex1".into(),
            latest: Some(ContainerId::from("c2")),
            runs,
        };

        assert_eq!(executor.latest_run().unwrap().forked_pid, Some(7));

        let no_latest = ExecutorState { id: "ex2".into(), latest: None, runs: HashMap::new() };
        assert!(no_latest.latest_run().is_none());
    }
}
