//! Artifact fetching into the sandbox
//!
//! Before an image is pulled, the URIs named by the command are placed into
//! the sandbox: http(s) sources are downloaded, anything else is treated as a
//! local path and copied. A fetch in flight can be cancelled through
//! [`Fetcher::kill`], which is how a destroy interrupts the FETCHING stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sandbox;
use crate::types::{CommandInfo, ContainerId, Uri};

/// Error type for fetch operations
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Failed to download {uri}: {message}")]
    Download { uri: String, message: String },

    #[error("Failed to copy {uri} into the sandbox: {source}")]
    Copy {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to extract {uri}: {message}")]
    Extract { uri: String, message: String },

    #[error("URI has no basename: {0}")]
    NoBasename(String),

    #[error("Fetch was killed")]
    Killed,

    #[error("Failed to chown fetched artifacts: {0}")]
    Chown(#[from] sandbox::SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads artifacts for a container into its sandbox.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch every URI of `command` into `directory`.
    async fn fetch(
        &self,
        container_id: &ContainerId,
        command: &CommandInfo,
        directory: &Path,
        user: Option<&str>,
    ) -> Result<(), FetchError>;

    /// Cancel an in-flight fetch for the container, if any.
    fn kill(&self, container_id: &ContainerId);
}

/// Default fetcher: http(s) downloads via reqwest, local paths copied.
pub struct UriFetcher {
    client: reqwest::Client,
    active: DashMap<ContainerId, CancellationToken>,
}

impl UriFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            active: DashMap::new(),
        }
    }

    async fn fetch_all(
        &self,
        command: &CommandInfo,
        directory: &Path,
        user: Option<&str>,
    ) -> Result<(), FetchError> {
        for uri in &command.uris {
            let destination = self.fetch_one(uri, directory).await?;

            if uri.executable {
                make_executable(&destination).await?;
            }

            if uri.extract {
                extract(uri, &destination, directory).await?;
            }
        }

        if let Some(user) = user {
            sandbox::chown_recursive(directory, user)?;
        }

        Ok(())
    }

    async fn fetch_one(&self, uri: &Uri, directory: &Path) -> Result<PathBuf, FetchError> {
        let basename = basename(&uri.value)?;
        let destination = directory.join(basename);

        if uri.value.starts_with("http://") || uri.value.starts_with("https://") {
            debug!("Downloading {} to {}", uri.value, destination.display());
            self.download(&uri.value, &destination).await?;
        } else {
            debug!("Copying {} to {}", uri.value, destination.display());
            tokio::fs::copy(&uri.value, &destination)
                .await
                .map_err(|source| FetchError::Copy { uri: uri.value.clone(), source })?;
        }

        Ok(destination)
    }

    async fn download(&self, uri: &str, destination: &Path) -> Result<(), FetchError> {
        let download_err = |message: String| FetchError::Download {
            uri: uri.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(uri)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| download_err(e.to_string()))?;

        let mut file = tokio::fs::File::create(destination).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| download_err(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(())
    }
}

impl Default for UriFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for UriFetcher {
    async fn fetch(
        &self,
        container_id: &ContainerId,
        command: &CommandInfo,
        directory: &Path,
        user: Option<&str>,
    ) -> Result<(), FetchError> {
        let token = CancellationToken::new();
        self.active.insert(container_id.clone(), token.clone());

        let result = tokio::select! {
            result = self.fetch_all(command, directory, user) => result,
            _ = token.cancelled() => Err(FetchError::Killed),
        };

        self.active.remove(container_id);
        result
    }

    fn kill(&self, container_id: &ContainerId) {
        if let Some((_, token)) = self.active.remove(container_id) {
            debug!("Killing fetch for container {}", container_id);
            token.cancel();
        }
    }
}

fn basename(uri: &str) -> Result<&str, FetchError> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| FetchError::NoBasename(uri.to_string()))
}

async fn make_executable(path: &Path) -> Result<(), FetchError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

/// Unpack recognised archives with the system tar; other files are left as
/// downloaded.
async fn extract(uri: &Uri, archive: &Path, directory: &Path) -> Result<(), FetchError> {
    let name = archive.to_string_lossy();
    let is_tarball = [".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tar.xz"]
        .iter()
        .any(|suffix| name.ends_with(suffix));

    if !is_tarball {
        warn!("Not extracting {}: unrecognised archive type", name);
        return Ok(());
    }

    let output = tokio::process::Command::new("tar")
        .arg("-C")
        .arg(directory)
        .arg("-xf")
        .arg(archive)
        .output()
        .await
        .map_err(|e| FetchError::Extract { uri: uri.value.clone(), message: e.to_string() })?;

    if !output.status.success() {
        return Err(FetchError::Extract {
            uri: uri.value.clone(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_with(uris: Vec<Uri>) -> CommandInfo {
        CommandInfo { uris, ..CommandInfo::default() }
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("http://host/path/artifact.tgz").unwrap(), "artifact.tgz");
        assert_eq!(basename("/local/file").unwrap(), "file");
        assert!(basename("http://host/").is_err());
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let source = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        let artifact = source.path().join("payload.sh");
        tokio::fs::write(&artifact, "#!/bin/sh\n").await.unwrap();

        let fetcher = UriFetcher::new();
        let command = command_with(vec![Uri {
            value: artifact.to_string_lossy().into_owned(),
            executable: true,
            extract: false,
        }]);

        fetcher
            .fetch(&ContainerId::from("c1"), &command, sandbox.path(), None)
            .await
            .unwrap();

        let fetched = sandbox.path().join("payload.sh");
        assert!(fetched.exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_fetch_missing_local_file() {
        let sandbox = tempfile::tempdir().unwrap();
        let fetcher = UriFetcher::new();
        let command = command_with(vec![Uri {
            value: "/definitely/not/here".into(),
            executable: false,
            extract: false,
        }]);

        assert!(matches!(
            fetcher
                .fetch(&ContainerId::from("c1"), &command, sandbox.path(), None)
                .await,
            Err(FetchError::Copy { .. })
        ));
    }

    #[tokio::test]
    async fn test_kill_before_fetch_is_noop() {
        let fetcher = UriFetcher::new();
        // No fetch in flight; kill must not panic.
        fetcher.kill(&ContainerId::from("c1"));
    }
}
