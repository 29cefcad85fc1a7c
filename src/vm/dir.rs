//! The per-VM working directory and its lifecycle record.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::HostkitError;
use crate::vm::VmSpec;

pub const DISK_IMAGE: &str = "disk.img";
const STATE_FILE: &str = "state";

/// Where a VM is in its lifecycle.
///
/// `Created` and `Installed` are persisted in the directory's `state` file.
/// `Running` only exists while the emulator process is attached; it is never
/// written, so a crashed emulator cannot leave a stale record behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No directory, or no record in it.
    Uninitialized,
    /// Disk, firmware variables and install media are in place.
    Created,
    /// The installer ran to completion at least once.
    Installed,
    Running,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Uninitialized => "uninitialized",
            VmState::Created => "created",
            VmState::Installed => "installed",
            VmState::Running => "running",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(VmState::Created),
            "installed" => Ok(VmState::Installed),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDirectory {
    name: String,
    path: PathBuf,
}

impl VmDirectory {
    /// `<root>/<arch>/<name>`
    pub fn locate(root: &Path, spec: &VmSpec) -> Self {
        Self {
            name: spec.name.clone(),
            path: root.join(spec.arch.as_str()).join(&spec.name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_image(&self) -> PathBuf {
        self.path.join(DISK_IMAGE)
    }

    pub fn file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Wipe whatever is there and start from an empty directory.
    pub async fn reset(&self) -> Result<(), HostkitError> {
        if self.path.is_dir() {
            tracing::info!(path = %self.path.display(), "removing existing VM directory");
            tokio::fs::remove_dir_all(&self.path)
                .await
                .map_err(|e| HostkitError::Io {
                    context: format!("removing {}", self.path.display()),
                    source: e,
                })?;
        }
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("creating directory {}", self.path.display()),
                source: e,
            })
    }

    pub async fn state(&self) -> Result<VmState, HostkitError> {
        let path = self.file(STATE_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(VmState::Uninitialized);
            }
            Err(e) => {
                return Err(HostkitError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };
        contents
            .trim()
            .parse()
            .map_err(|bad| HostkitError::Validation {
                message: format!("unrecognized state '{bad}' in {}", path.display()),
            })
    }

    pub async fn set_state(&self, state: VmState) -> Result<(), HostkitError> {
        let path = self.file(STATE_FILE);
        tokio::fs::write(&path, format!("{state}\n"))
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("writing {}", path.display()),
                source: e,
            })?;
        tracing::debug!(vm = %self.name, %state, "recorded VM state");
        Ok(())
    }

    /// Fail with `InvalidState` unless the recorded state is one of `allowed`.
    pub async fn require(&self, allowed: &[VmState]) -> Result<VmState, HostkitError> {
        let current = self.state().await?;
        if allowed.contains(&current) {
            return Ok(current);
        }
        Err(HostkitError::InvalidState {
            name: self.name.clone(),
            current: current.to_string(),
            required: allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
        })
    }
}
