//! Sandbox preparation
//!
//! Before a container launches, its sandbox directory gets empty `stdout` and
//! `stderr` files and ownership by the run-as user. A path containing a colon
//! additionally gets a stable symlink under the agent's links directory,
//! because the Docker CLI treats `:` as a volume separator and cannot mount
//! such paths directly.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::types::{ContainerId, SlaveId};

/// Error type for sandbox preparation
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Failed to chown {} to {user}: {source}", path.display())]
    Chown {
        path: PathBuf,
        user: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to symlink {} -> {}: {source}", link.display(), target.display())]
    Symlink {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A prepared sandbox: the effective directory handed to Docker, and whether
/// it is a symlink standing in for a colon-containing path.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub directory: PathBuf,
    pub symlinked: bool,
}

/// Prepare the sandbox for a launch.
pub async fn prepare(
    directory: &Path,
    user: Option<&str>,
    work_dir: &Path,
    slave_id: &SlaveId,
    container_id: &ContainerId,
) -> Result<Sandbox, SandboxError> {
    for name in ["stdout", "stderr"] {
        let path = directory.join(name);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| SandboxError::Create { path, source })?;
    }

    if let Some(user) = user {
        chown_recursive(directory, user)?;
    }

    let links_dir = links_directory(work_dir, slave_id);
    tokio::fs::create_dir_all(&links_dir)
        .await
        .map_err(|source| SandboxError::Create { path: links_dir.clone(), source })?;

    if directory.to_string_lossy().contains(':') {
        let link = links_dir.join(container_id.as_str());
        symlink(directory, &link).await?;
        debug!(
            "Sandbox {} contains a colon, using symlink {}",
            directory.display(),
            link.display()
        );
        return Ok(Sandbox { directory: link, symlinked: true });
    }

    Ok(Sandbox { directory: directory.to_path_buf(), symlinked: false })
}

/// Directory holding the colon-path symlinks for one agent.
pub fn links_directory(work_dir: &Path, slave_id: &SlaveId) -> PathBuf {
    work_dir.join(slave_id.as_str()).join("docker").join("links")
}

/// Recursively chown a directory tree to the given user.
pub fn chown_recursive(directory: &Path, user: &str) -> Result<(), SandboxError> {
    let resolved = nix::unistd::User::from_name(user)
        .map_err(|_| SandboxError::UnknownUser(user.to_string()))?
        .ok_or_else(|| SandboxError::UnknownUser(user.to_string()))?;

    chown_tree(directory, resolved.uid, resolved.gid, user)
}

fn chown_tree(
    path: &Path,
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
    user: &str,
) -> Result<(), SandboxError> {
    let chown_err = |source: std::io::Error| SandboxError::Chown {
        path: path.to_path_buf(),
        user: user.to_string(),
        source,
    };

    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| chown_err(std::io::Error::from(e)))?;

    if path.is_dir() {
        for entry in std::fs::read_dir(path).map_err(chown_err)? {
            let entry = entry.map_err(chown_err)?;
            chown_tree(&entry.path(), uid, gid, user)?;
        }
    }

    Ok(())
}

async fn symlink(target: &Path, link: &Path) -> Result<(), SandboxError> {
    match tokio::fs::symlink(target, link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A stale link from a previous run of the same container id is
            // fine as long as it points at the same sandbox.
            match tokio::fs::read_link(link).await {
                Ok(existing) if existing == target => Ok(()),
                _ => {
                    warn!("Replacing stale sandbox link {}", link.display());
                    tokio::fs::remove_file(link).await.map_err(|source| {
                        SandboxError::Symlink {
                            link: link.to_path_buf(),
                            target: target.to_path_buf(),
                            source,
                        }
                    })?;
                    tokio::fs::symlink(target, link).await.map_err(|source| {
                        SandboxError::Symlink {
                            link: link.to_path_buf(),
                            target: target.to_path_buf(),
                            source,
                        }
                    })
                }
            }
        }
        Err(source) => Err(SandboxError::Symlink {
            link: link.to_path_buf(),
            target: target.to_path_buf(),
            source,
        }),
    }
}
