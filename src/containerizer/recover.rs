//! Recovery of in-flight containers across agent restarts
//!
//! A restarted agent hands in its persisted state (frameworks, executors and
//! their latest runs with checkpointed helper pids). That state is reconciled
//! with the containers Docker still knows about: surviving helpers are
//! reattached by pid, helpers the restart orphaned are reattached through a
//! fresh `docker wait` stand-in, and everything unclaimed is optionally swept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checkpoint::{RunState, SlaveState};
use crate::docker::name;
use crate::reaper;
use crate::types::{ContainerId, SlaveId};

use super::container::Container;
use super::{executor, Containerizer, Error};

impl Containerizer {
    /// Reconcile persisted executor runs with live Docker containers.
    pub async fn recover(&self, state: Option<SlaveState>) -> Result<(), Error> {
        info!("Recovering Docker containers");

        let names = self.docker_client().ps(true, name::NAME_PREFIX).await?;

        // Partition live containers into workload containers and executor
        // helpers; anything with a foreign name is ignored.
        let mut primaries: HashMap<ContainerId, String> = HashMap::new();
        let mut helpers: HashMap<ContainerId, String> = HashMap::new();

        for container_name in names {
            match name::parse(&container_name) {
                Some(parsed) if parsed.executor => {
                    helpers.insert(parsed.container_id, container_name);
                }
                Some(parsed) => {
                    primaries.insert(parsed.container_id, container_name);
                }
                None => {
                    debug!("Ignoring container {}: not owned by this agent", container_name);
                }
            }
        }

        let mut claimed: HashMap<i32, ContainerId> = HashMap::new();
        let mut recovered: HashSet<ContainerId> = HashSet::new();

        if let Some(state) = &state {
            for framework in &state.frameworks {
                for executor_state in &framework.executors {
                    let run = match executor_state.latest_run() {
                        Some(run) => run,
                        None => continue,
                    };

                    if run.completed {
                        debug!("Skipping completed run {}", run.id);
                        continue;
                    }

                    // Without a checkpointed pid there is nothing to reattach;
                    // the agent's own wait will deliver a failed termination.
                    let pid = match run.forked_pid {
                        Some(pid) => pid,
                        None => {
                            debug!("Run {} has no checkpointed pid, skipping", run.id);
                            continue;
                        }
                    };

                    if let Some(other) = claimed.get(&pid) {
                        return Err(Error::DuplicatePid { pid, claimed_by: other.clone() });
                    }
                    claimed.insert(pid, run.id.clone());

                    if self.reattach(&state.id, run, pid, &primaries, &helpers).await? {
                        recovered.insert(run.id.clone());
                    }
                }
            }
        }

        if self.config_ref().docker.kill_orphans {
            self.kill_orphans(&primaries, &helpers, &recovered).await;
        }

        info!("Recovered {} Docker containers", recovered.len());
        Ok(())
    }

    /// Re-create a container record for one persisted run and arm a reaper
    /// for it. Returns whether the run was claimed.
    async fn reattach(
        &self,
        slave_id: &SlaveId,
        run: &RunState,
        pid: i32,
        primaries: &HashMap<ContainerId, String>,
        helpers: &HashMap<ContainerId, String>,
    ) -> Result<bool, Error> {
        let id = &run.id;
        let container_name = primaries
            .get(id)
            .cloned()
            .unwrap_or_else(|| name::container_name(slave_id, id));
        let executor_name = helpers
            .get(id)
            .cloned()
            .unwrap_or_else(|| name::executor_name(slave_id, id));

        if reaper::alive(pid) {
            if !primaries.contains_key(id) {
                warn!(
                    "Helper pid {} of container {} is alive but no matching container exists",
                    pid, id
                );
                return Ok(false);
            }

            info!("Reattaching container {} to live helper pid {}", id, pid);

            let container = self
                .resurrect(run, slave_id, container_name, executor_name, Some(pid))
                .await;

            let status = container.status.clone();
            let this = self.clone();
            let reaped_id = id.clone();
            tokio::spawn(async move {
                // A foreign pid can only be polled; its status is unknown.
                let code = reaper::reap_pid(pid).await;
                status.set(code);
                this.destroy_with(&reaped_id, false, None).await;
            });

            return Ok(true);
        }

        // The pid died with the agent's container, but the workload and its
        // helper may have survived: the agent was itself running in Docker
        // and forgot its children on restart. A fresh `docker wait` stand-in
        // takes the dead pid's place.
        if primaries.contains_key(id) && helpers.contains_key(id) {
            info!(
                "Helper pid {} of container {} is gone, reattaching via docker wait",
                pid, id
            );

            let child =
                executor::spawn_wait_standin(&self.config_ref().docker.binary, &executor_name)
                    .map_err(|e| {
                        Error::Executor(format!("Failed to spawn docker wait: {}", e))
                    })?;

            let container = self
                .resurrect(run, slave_id, container_name, executor_name, None)
                .await;

            let status = container.status.clone();
            let this = self.clone();
            let reaped_id = id.clone();
            tokio::spawn(async move {
                let code = reaper::reap_child(child).await;
                status.set(code);
                this.destroy_with(&reaped_id, false, None).await;
            });

            return Ok(true);
        }

        debug!(
            "Run {} has neither a live pid nor surviving containers, nothing to reattach",
            id
        );
        Ok(false)
    }

    /// Insert a recovered container record and, when the run's sandbox is
    /// known, resume output capture through `docker logs`.
    async fn resurrect(
        &self,
        run: &RunState,
        slave_id: &SlaveId,
        container_name: String,
        executor_name: String,
        executor_pid: Option<i32>,
    ) -> Arc<Container> {
        let mut container = Container::recovered(
            run.id.clone(),
            slave_id.clone(),
            container_name,
            executor_name,
            executor_pid,
        );
        container.directory = run.directory.clone();

        let container = Arc::new(container);
        self.insert(container.clone());

        if let Some(directory) = &run.directory {
            if let Err(e) = self.docker_client().logs(&container.name, directory).await {
                warn!("Failed to resume log capture for {}: {}", container.name, e);
            }
        }

        container
    }

    /// Stop and remove every agent-named container that recovery did not
    /// claim.
    async fn kill_orphans(
        &self,
        primaries: &HashMap<ContainerId, String>,
        helpers: &HashMap<ContainerId, String>,
        recovered: &HashSet<ContainerId>,
    ) {
        let timeout = self.config_ref().docker.stop_timeout();

        for (id, container_name) in primaries.iter().chain(helpers.iter()) {
            if recovered.contains(id) {
                continue;
            }

            info!("Stopping orphan container {}", container_name);
            if let Err(e) = self.docker_client().stop(container_name, timeout).await {
                warn!("Failed to stop orphan container {}: {}", container_name, e);
            }
            if let Err(e) = self.docker_client().rm(container_name, true).await {
                warn!("Failed to remove orphan container {}: {}", container_name, e);
            }
        }
    }
}
