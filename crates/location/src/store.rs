//! Snapshot inventory and lifecycle inside one container subvolume.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use endpoint::{CommandLine, Endpoint, EndpointError};

use crate::SnapshotName;

/// A snapshot operation against the underlying filesystem failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The endpoint could not run the filesystem command.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// A snapshot with this name already exists in the container.
    ///
    /// Transient: taking the next snapshot a second later resolves it.
    #[error("snapshot `{name}` already exists in `{}`", container.display())]
    NameCollision {
        /// The colliding name.
        name: SnapshotName,
        /// The container holding it.
        container: PathBuf,
    },
    /// An inventory line did not look like a subvolume listing.
    #[error("unrecognised subvolume listing line: `{line}`")]
    UnparsableListing {
        /// The offending line.
        line: String,
    },
    /// The container holds entries from more than one directory, indicating
    /// a nested subvolume layout the tool refuses to manage.
    #[error(
        "inconsistent container layout under `{}`: `{first}` vs `{second}`; \
         each job needs a dedicated container subvolume",
        container.display()
    )]
    NestedLayout {
        /// The container being listed.
        container: PathBuf,
        /// A path from the majority location.
        first: String,
        /// The path disagreeing with it.
        second: String,
    },
}

/// The set of managed snapshots in one container subvolume on one endpoint.
pub struct SnapshotStore {
    endpoint: Arc<dyn Endpoint>,
    container: PathBuf,
}

impl SnapshotStore {
    /// A store over `container` on `endpoint`.
    #[must_use]
    pub fn new(endpoint: Arc<dyn Endpoint>, container: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            container: container.into(),
        }
    }

    /// The endpoint this store operates on.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// The container subvolume path.
    #[must_use]
    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Absolute path of a named snapshot inside the container.
    #[must_use]
    pub fn snapshot_path(&self, name: &SnapshotName) -> PathBuf {
        self.container.join(name.to_string())
    }

    /// Managed snapshots in the container, ascending by timestamp.
    ///
    /// Entries whose basename is not a snapshot name are ignored, never
    /// deleted. Entries spread over several directories are rejected as a
    /// nested layout.
    pub fn list(&self) -> Result<Vec<SnapshotName>, StoreError> {
        let output = self.endpoint.exec(
            &CommandLine::new("btrfs")
                .args(["subvolume", "list", "-o"])
                .arg(self.container.to_string_lossy()),
        )?;

        let mut names = Vec::new();
        let mut first_parent: Option<(String, String)> = None;
        for line in output.stdout_text().lines() {
            if line.trim().is_empty() {
                continue;
            }
            let path = listed_path(line).ok_or_else(|| StoreError::UnparsableListing {
                line: line.to_string(),
            })?;

            let (parent, basename) = match path.rsplit_once('/') {
                Some((parent, basename)) => (parent.to_string(), basename),
                None => (String::new(), path),
            };
            match &first_parent {
                Some((seen, witness)) if *seen != parent => {
                    return Err(StoreError::NestedLayout {
                        container: self.container.clone(),
                        first: witness.clone(),
                        second: path.to_string(),
                    });
                }
                Some(_) => {}
                None => first_parent = Some((parent, path.to_string())),
            }

            if let Ok(name) = basename.parse::<SnapshotName>() {
                names.push(name);
            }
        }

        names.sort_unstable();
        debug!(
            container = %self.container.display(),
            count = names.len(),
            "listed snapshots"
        );
        Ok(names)
    }

    /// Creates a read-only snapshot of `source` in the container, named for
    /// `now`.
    ///
    /// Fails with [`StoreError::NameCollision`] when a snapshot of the same
    /// second already exists; the caller retries after a pause.
    pub fn create(&self, source: &Path, now: OffsetDateTime) -> Result<SnapshotName, StoreError> {
        let name = SnapshotName::at(now);
        let target = self.snapshot_path(&name);

        if self.endpoint.dir_exists(&target)? {
            return Err(StoreError::NameCollision {
                name,
                container: self.container.clone(),
            });
        }

        info!(snapshot = %name, source = %source.display(), "creating snapshot");
        self.endpoint.exec(
            &CommandLine::new("btrfs")
                .args(["subvolume", "snapshot", "-r"])
                .arg(source.to_string_lossy())
                .arg(target.to_string_lossy()),
        )?;
        Ok(name)
    }

    /// Deletes a snapshot subvolume. Deleting a name that is not present is
    /// a no-op.
    pub fn delete(&self, name: &SnapshotName) -> Result<(), StoreError> {
        let path = self.snapshot_path(name);
        if !self.endpoint.dir_exists(&path)? {
            return Ok(());
        }
        info!(snapshot = %name, container = %self.container.display(), "deleting snapshot");
        self.endpoint.exec(
            &CommandLine::new("btrfs")
                .args(["subvolume", "delete"])
                .arg(path.to_string_lossy()),
        )?;
        Ok(())
    }

    /// Creates the container subvolume when missing and verifies it really
    /// is a subvolume.
    pub fn ensure_container(&self) -> Result<(), StoreError> {
        if !self.endpoint.dir_exists(&self.container)? {
            info!(container = %self.container.display(), "creating container subvolume");
            self.endpoint.exec(
                &CommandLine::new("btrfs")
                    .args(["subvolume", "create"])
                    .arg(self.container.to_string_lossy()),
            )?;
        }
        self.endpoint.exec(
            &CommandLine::new("btrfs")
                .args(["subvolume", "show"])
                .arg(self.container.to_string_lossy()),
        )?;
        Ok(())
    }

    /// Deletes the container subvolume itself.
    pub fn remove_container(&self) -> Result<(), StoreError> {
        if !self.endpoint.dir_exists(&self.container)? {
            return Ok(());
        }
        info!(container = %self.container.display(), "removing container subvolume");
        self.endpoint.exec(
            &CommandLine::new("btrfs")
                .args(["subvolume", "delete"])
                .arg(self.container.to_string_lossy()),
        )?;
        Ok(())
    }

    /// The send command producing the delta stream for `name`, incremental
    /// against `parent` when given.
    #[must_use]
    pub fn send_command(
        &self,
        parent: Option<&SnapshotName>,
        name: &SnapshotName,
    ) -> CommandLine {
        let mut command = CommandLine::new("btrfs").arg("send");
        if let Some(parent) = parent {
            command = command
                .arg("-p")
                .arg(self.snapshot_path(parent).to_string_lossy());
        }
        command.arg(self.snapshot_path(name).to_string_lossy())
    }

    /// The receive command materialising an incoming stream in the container.
    #[must_use]
    pub fn receive_command(&self) -> CommandLine {
        CommandLine::new("btrfs")
            .arg("receive")
            .arg(self.container.to_string_lossy())
    }
}

/// The `path` column of one `btrfs subvolume list` line.
fn listed_path(line: &str) -> Option<&str> {
    if !line.starts_with("ID ") {
        return None;
    }
    let (_, path) = line.split_once(" path ")?;
    let path = path.trim();
    if path.is_empty() { None } else { Some(path) }
}
