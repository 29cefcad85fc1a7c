//! Turn a blank block device into one ext4 partition mounted through fstab.

use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::DiskSettings;
use crate::error::HostkitError;
use crate::host::packages::PackageManager;
use crate::host::users::chown_recursive;
use crate::runner::{Cmd, Runner};

/// Result of a successful provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTarget {
    pub device_path: PathBuf,
    pub volume_path: PathBuf,
    pub mountpoint: PathBuf,
    pub uuid: String,
}

/// First partition of a whole-disk device node.
pub fn partition_path(device: &str) -> Result<PathBuf, HostkitError> {
    let suffix = if device.starts_with("/dev/nvme") {
        "p1"
    } else if device.starts_with("/dev/sd") {
        "1"
    } else {
        return Err(HostkitError::UnrecognizedDeviceNaming {
            device: device.to_string(),
        });
    };
    Ok(PathBuf::from(format!("{device}{suffix}")))
}

/// Questions about the host's devices and mounts.
pub trait HostProbe {
    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, HostkitError>;
    fn is_block_device(&self, path: &Path) -> bool;
}

/// Answers from the live system: a mount table file and `stat`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    mount_table: PathBuf,
}

impl SystemProbe {
    pub fn new(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }
}

impl HostProbe for SystemProbe {
    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, HostkitError> {
        let table = std::fs::read_to_string(&self.mount_table).map_err(|e| HostkitError::Io {
            context: format!("reading mount table {}", self.mount_table.display()),
            source: e,
        })?;
        let wanted = normalize(mountpoint);
        Ok(table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|target| normalize(Path::new(&unescape_mount_field(target))) == wanted))
    }

    fn is_block_device(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// The kernel writes spaces, tabs and backslashes in mount paths as `\ooo`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// fstab and the mount table only hold absolute paths.
fn absolute_mountpoint(mountpoint: &Path) -> Result<PathBuf, HostkitError> {
    std::path::absolute(mountpoint)
        .map(|p| normalize(&p))
        .map_err(|e| HostkitError::Io {
            context: format!("resolving mountpoint {}", mountpoint.display()),
            source: e,
        })
}

/// fstab line registering `uuid` at `mountpoint`.
pub fn fstab_entry(uuid: &str, mountpoint: &Path) -> String {
    format!("UUID={uuid}\t{}\text4\tnoatime\t0\t2\n", mountpoint.display())
}

/// Append `entry`, first terminating an unterminated last line.
pub fn append_fstab(fstab: &Path, entry: &str) -> Result<(), HostkitError> {
    let io = |e: std::io::Error| HostkitError::Io {
        context: format!("updating {}", fstab.display()),
        source: e,
    };
    let existing = match std::fs::read(fstab) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(io(e)),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(fstab)
        .map_err(io)?;
    if existing.last().is_some_and(|b| *b != b'\n') {
        file.write_all(b"\n").map_err(io)?;
    }
    file.write_all(entry.as_bytes()).map_err(io)
}

pub struct DiskProvisioner<'a, R: Runner, P: HostProbe> {
    runner: &'a R,
    settings: &'a DiskSettings,
    probe: P,
    on_path: fn(&str) -> bool,
}

impl<'a, R: Runner, P: HostProbe> DiskProvisioner<'a, R, P> {
    pub fn new(runner: &'a R, settings: &'a DiskSettings, probe: P) -> Self {
        Self {
            runner,
            settings,
            probe,
            on_path: crate::runner::on_path,
        }
    }

    pub fn path_probe(mut self, on_path: fn(&str) -> bool) -> Self {
        self.on_path = on_path;
        self
    }

    /// Partition, format, register and mount `device` at `mountpoint`.
    ///
    /// A relative `mountpoint` is taken from the current directory. `owner`
    /// receives the mountpoint afterwards; it is not needed (and not applied)
    /// when the mountpoint is `/home`.
    pub async fn provision(
        &self,
        device: &str,
        mountpoint: &Path,
        owner: Option<&str>,
    ) -> Result<PartitionTarget, HostkitError> {
        let volume = partition_path(device)?;
        let mountpoint = absolute_mountpoint(mountpoint)?;
        let mountpoint = mountpoint.as_path();
        let is_home = mountpoint == Path::new("/home");
        let owner = match (is_home, owner) {
            (true, _) => None,
            (false, Some(o)) => Some(o),
            (false, None) => {
                return Err(HostkitError::Validation {
                    message: format!("no owner given for {}", mountpoint.display()),
                });
            }
        };

        if self.probe.is_mounted(mountpoint)? {
            return Err(HostkitError::Precondition {
                message: format!("mountpoint ('{}') is already mounted", mountpoint.display()),
            });
        }
        if self.probe.is_block_device(&volume) {
            return Err(HostkitError::Precondition {
                message: format!("volume ('{}') already exists", volume.display()),
            });
        }

        self.ensure_parted().await?;

        tracing::info!(device, volume = %volume.display(), "partitioning");
        self.runner
            .output(
                &Cmd::new("parted")
                    .args(["-s", device, "mklabel", "gpt", "mkpart", "primary", "ext4"])
                    .args(["0%", "100%"]),
            )
            .await?;
        self.wait_for_volume(&volume).await?;

        self.runner
            .output(&Cmd::new("mkfs").args(["-t", "ext4"]).path(&volume))
            .await?;
        let uuid = self
            .runner
            .output(
                &Cmd::new("blkid")
                    .args(["-o", "value", "-s", "UUID"])
                    .path(&volume),
            )
            .await?;
        if uuid.is_empty() {
            return Err(HostkitError::Precondition {
                message: format!("blkid reported no UUID for {}", volume.display()),
            });
        }

        append_fstab(&self.settings.fstab, &fstab_entry(&uuid, mountpoint))?;
        tracing::info!(fstab = %self.settings.fstab.display(), uuid, "registered in fstab");
        self.runner
            .output(&Cmd::new("systemctl").arg("daemon-reload"))
            .await?;

        tokio::fs::create_dir_all(mountpoint)
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("creating {}", mountpoint.display()),
                source: e,
            })?;
        self.runner.output(&Cmd::new("mount").arg("-a")).await?;

        if let Some(owner) = owner {
            chown_recursive(self.runner, owner, mountpoint).await?;
        }

        Ok(PartitionTarget {
            device_path: PathBuf::from(device),
            volume_path: volume,
            mountpoint: mountpoint.to_path_buf(),
            uuid,
        })
    }

    async fn ensure_parted(&self) -> Result<(), HostkitError> {
        if (self.on_path)("parted") {
            return Ok(());
        }
        match PackageManager::detect_with(self.on_path) {
            Some(pm @ (PackageManager::Pacman | PackageManager::Apt)) => {
                tracing::info!(?pm, "installing parted");
                pm.install(self.runner, &["parted"]).await?;
            }
            _ => {
                return Err(HostkitError::Precondition {
                    message: "parted is needed but cannot be installed on this OS".into(),
                });
            }
        }
        if (self.on_path)("parted") {
            Ok(())
        } else {
            Err(HostkitError::Precondition {
                message: "parted is still missing after installation".into(),
            })
        }
    }

    /// Poll until the kernel has created the partition node.
    async fn wait_for_volume(&self, volume: &Path) -> Result<(), HostkitError> {
        let start = Instant::now();
        loop {
            if self.probe.is_block_device(volume) {
                tracing::debug!(volume = %volume.display(), elapsed = ?start.elapsed(), "partition ready");
                return Ok(());
            }
            if start.elapsed() >= self.settings.settle_timeout {
                return Err(HostkitError::Timeout {
                    what: format!("partition {}", volume.display()),
                    seconds: self.settings.settle_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
