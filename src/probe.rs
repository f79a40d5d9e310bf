//! Resource usage probe
//!
//! Resolves CPU time and resident memory for a container's init process
//! (optionally including its descendants) from /proc. The containerizer
//! overlays the declared limits on top of what the probe reports.

use async_trait::async_trait;
use tracing::debug;

use crate::types::ResourceStatistics;

/// Error type for usage probing
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Process {0} not found")]
    NotFound(i32),

    #[error("Failed to read /proc: {0}")]
    Proc(String),
}

/// Samples resource usage of a process tree.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Usage of `pid`, including descendants when `include_children` is set.
    async fn usage(
        &self,
        pid: i32,
        include_children: bool,
    ) -> Result<ResourceStatistics, ProbeError>;
}

/// /proc-backed probe.
pub struct ProcProbe;

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn usage(
        &self,
        pid: i32,
        include_children: bool,
    ) -> Result<ResourceStatistics, ProbeError> {
        tokio::task::spawn_blocking(move || sample(pid, include_children))
            .await
            .unwrap_or_else(|e| Err(ProbeError::Proc(format!("sampling task failed: {}", e))))
    }
}

/// Seconds since the epoch.
pub fn timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn sample(pid: i32, include_children: bool) -> Result<ResourceStatistics, ProbeError> {
    let ticks = procfs::ticks_per_second() as f64;
    let page_size = procfs::page_size();

    let mut pids = vec![pid];
    if include_children {
        pids.extend(descendants(pid)?);
    }

    let mut user_ticks = 0u64;
    let mut system_ticks = 0u64;
    let mut rss_pages = 0u64;
    let mut found = false;

    for pid in pids {
        let process = match procfs::process::Process::new(pid) {
            Ok(process) => process,
            // Children may exit while we walk the tree.
            Err(_) => continue,
        };
        let stat = match process.stat() {
            Ok(stat) => stat,
            Err(_) => continue,
        };

        found = true;
        user_ticks += stat.utime;
        system_ticks += stat.stime;
        rss_pages += stat.rss.max(0) as u64;
    }

    if !found {
        return Err(ProbeError::NotFound(pid));
    }

    debug!(
        "Sampled pid {}: {} user ticks, {} system ticks, {} rss pages",
        pid, user_ticks, system_ticks, rss_pages
    );

    Ok(ResourceStatistics {
        timestamp: timestamp(),
        cpus_limit: None,
        cpus_user_time_secs: Some(user_ticks as f64 / ticks),
        cpus_system_time_secs: Some(system_ticks as f64 / ticks),
        mem_limit_bytes: None,
        mem_rss_bytes: Some(rss_pages * page_size),
    })
}

/// All descendant pids of `pid`, walked through the process table.
fn descendants(pid: i32) -> Result<Vec<i32>, ProbeError> {
    let mut children: std::collections::HashMap<i32, Vec<i32>> = std::collections::HashMap::new();

    let processes = procfs::process::all_processes()
        .map_err(|e| ProbeError::Proc(e.to_string()))?;

    for process in processes.flatten() {
        if let Ok(stat) = process.stat() {
            children.entry(stat.ppid).or_default().push(stat.pid);
        }
    }

    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        if let Some(direct) = children.get(&parent) {
            for child in direct {
                result.push(*child);
                frontier.push(*child);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_of_self() {
        let stats = ProcProbe
            .usage(std::process::id() as i32, false)
            .await
            .unwrap();

        assert!(stats.timestamp > 0.0);
        assert!(stats.mem_rss_bytes.unwrap() > 0);
        assert!(stats.cpus_user_time_secs.is_some());
        assert!(stats.cpus_system_time_secs.is_some());
    }

    #[tokio::test]
    async fn test_usage_of_dead_pid() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();

        assert!(matches!(
            ProcProbe.usage(pid, false).await,
            Err(ProbeError::NotFound(_))
        ));
    }
}
