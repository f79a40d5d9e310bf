//! Cgroup discovery and control-file writes (v1 hierarchies)
//!
//! Resource updates translate a new allocation into writes against the `cpu`
//! and `memory` subsystems of the pid's cgroup. Hierarchy mount points are
//! discovered once per process and memoised.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

/// CPU shares granted per fractional CPU.
pub const CPU_SHARES_PER_CPU: u64 = 1024;

/// Kernel-imposed floor for `cpu.shares`.
pub const MIN_CPU_SHARES: u64 = 2;

/// Floor for the memory limit; smaller requests are rounded up.
pub const MIN_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

/// Error type for cgroup operations
#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("Cgroup subsystem {0} is not mounted")]
    NotMounted(String),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed value in {}: {value:?}", path.display())]
    Malformed { path: PathBuf, value: String },
}

static HIERARCHIES: Lazy<Mutex<HashMap<String, Option<PathBuf>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Mount point of a cgroup v1 subsystem, memoised process-globally.
pub fn hierarchy(subsystem: &str) -> Result<PathBuf, CgroupError> {
    let mut cache = HIERARCHIES.lock();
    let entry = cache
        .entry(subsystem.to_string())
        .or_insert_with(|| discover(subsystem, Path::new("/proc/mounts")));

    entry
        .clone()
        .ok_or_else(|| CgroupError::NotMounted(subsystem.to_string()))
}

/// Scan a mounts table for the hierarchy carrying `subsystem`.
fn discover(subsystem: &str, mounts: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(mounts).ok()?;
    for line in content.lines() {
        // <device> <mountpoint> <fstype> <options> <dump> <pass>
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mountpoint = fields.next()?;
        let fstype = fields.next()?;
        let options = fields.next()?;

        if fstype == "cgroup" && options.split(',').any(|option| option == subsystem) {
            debug!("Found {} hierarchy at {}", subsystem, mountpoint);
            return Some(PathBuf::from(mountpoint));
        }
    }
    None
}

/// The cgroup a pid belongs to within `subsystem`, from `/proc/<pid>/cgroup`.
///
/// Returns `Ok(None)` when the pid is not a member of that subsystem.
pub fn cgroup_of(subsystem: &str, pid: i32) -> Result<Option<String>, CgroupError> {
    let path = PathBuf::from(format!("/proc/{}/cgroup", pid));
    let content = std::fs::read_to_string(&path)
        .map_err(|source| CgroupError::Read { path, source })?;

    Ok(parse_cgroup_entry(&content, subsystem))
}

/// Parse one `/proc/<pid>/cgroup` document: `<id>:<controllers>:<path>` lines.
fn parse_cgroup_entry(content: &str, subsystem: &str) -> Option<String> {
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let controllers = fields.next()?;
        let cgroup = fields.next()?;

        if controllers.split(',').any(|controller| controller == subsystem) {
            return Some(cgroup.to_string());
        }
    }
    None
}

fn control_path(hierarchy: &Path, cgroup: &str, control: &str) -> PathBuf {
    hierarchy
        .join(cgroup.trim_start_matches('/'))
        .join(control)
}

/// Write a cgroup control file.
pub fn write_control(
    hierarchy: &Path,
    cgroup: &str,
    control: &str,
    value: &str,
) -> Result<(), CgroupError> {
    let path = control_path(hierarchy, cgroup, control);
    std::fs::write(&path, value).map_err(|source| CgroupError::Write { path, source })
}

/// Read a cgroup control file as a u64.
pub fn read_control_u64(
    hierarchy: &Path,
    cgroup: &str,
    control: &str,
) -> Result<u64, CgroupError> {
    let path = control_path(hierarchy, cgroup, control);
    let content = std::fs::read_to_string(&path)
        .map_err(|source| CgroupError::Read { path: path.clone(), source })?;

    let trimmed = content.trim();
    trimmed
        .parse::<u64>()
        .map_err(|_| CgroupError::Malformed { path, value: trimmed.to_string() })
}

/// Shares written for a CPU allocation.
pub fn cpu_shares(cpus: f64) -> u64 {
    ((CPU_SHARES_PER_CPU as f64 * cpus) as u64).max(MIN_CPU_SHARES)
}

/// Apply a CPU allocation: `cpu.shares = max(1024 × cpus, floor)`.
pub fn apply_cpu(hierarchy: &Path, cgroup: &str, cpus: f64) -> Result<u64, CgroupError> {
    let shares = cpu_shares(cpus);
    write_control(hierarchy, cgroup, "cpu.shares", &shares.to_string())?;
    Ok(shares)
}

/// Apply a memory allocation.
///
/// The soft limit always follows the allocation. The hard limit is only ever
/// raised: lowering it while tasks run is disallowed, so a smaller request
/// leaves the current hard limit in place.
pub fn apply_memory(hierarchy: &Path, cgroup: &str, mem_bytes: u64) -> Result<u64, CgroupError> {
    let limit = mem_bytes.max(MIN_MEMORY_BYTES);

    write_control(
        hierarchy,
        cgroup,
        "memory.soft_limit_in_bytes",
        &limit.to_string(),
    )?;

    let current = read_control_u64(hierarchy, cgroup, "memory.limit_in_bytes")?;
    if limit > current {
        write_control(hierarchy, cgroup, "memory.limit_in_bytes", &limit.to_string())?;
    }

    Ok(limit)
}
