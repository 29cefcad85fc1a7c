//! Firmware and install media for a guest architecture.

use std::path::{Path, PathBuf};

use crate::config::VmSettings;
use crate::error::HostkitError;
use crate::vm::dir::VmDirectory;
use crate::vm::{Arch, download};

pub struct ResourceLocator<'a> {
    arch: Arch,
    settings: &'a VmSettings,
}

impl<'a> ResourceLocator<'a> {
    pub fn new(arch: Arch, settings: &'a VmSettings) -> Self {
        Self { arch, settings }
    }

    /// The read-only UEFI code image. Never fetched: it must be installed.
    pub fn firmware_code(&self) -> Result<PathBuf, HostkitError> {
        let path = self
            .settings
            .firmware_code
            .clone()
            .unwrap_or_else(|| self.arch.firmware_code());
        require_file("firmware code image", path)
    }

    /// System template the per-VM variable store is copied from.
    pub fn firmware_vars_template(&self) -> Result<PathBuf, HostkitError> {
        let path = self
            .settings
            .firmware_vars
            .clone()
            .unwrap_or_else(|| self.arch.firmware_vars_template());
        require_file("firmware variables template", path)
    }

    /// Where the VM's own copy of the variable store lives.
    pub fn firmware_vars_path(&self, dir: &VmDirectory) -> Result<PathBuf, HostkitError> {
        let template = self
            .settings
            .firmware_vars
            .clone()
            .unwrap_or_else(|| self.arch.firmware_vars_template());
        let name = template
            .file_name()
            .ok_or_else(|| HostkitError::Validation {
                message: format!(
                    "firmware variables template has no file name: {}",
                    template.display()
                ),
            })?;
        Ok(dir.file(name))
    }

    /// Copy the variable store template into `dir` unless a copy is already there.
    pub async fn ensure_firmware_vars(&self, dir: &VmDirectory) -> Result<PathBuf, HostkitError> {
        let dest = self.firmware_vars_path(dir)?;
        if dest.exists() {
            return Ok(dest);
        }
        let template = self.firmware_vars_template()?;
        tokio::fs::copy(&template, &dest)
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("copying {} to {}", template.display(), dest.display()),
                source: e,
            })?;
        tracing::info!(path = %dest.display(), "copied firmware variables");
        Ok(dest)
    }

    /// The VM's existing variable store. Its absence means the directory was
    /// never created, or was tampered with.
    pub fn existing_firmware_vars(&self, dir: &VmDirectory) -> Result<PathBuf, HostkitError> {
        require_file("firmware variables", self.firmware_vars_path(dir)?)
    }

    /// Fetch the install media into `dir` if it is not cached there yet.
    pub async fn ensure_installer(&self, dir: &VmDirectory) -> Result<PathBuf, HostkitError> {
        download::ensure_present(&self.settings.installer, dir.path()).await
    }
}

fn require_file(what: &str, path: PathBuf) -> Result<PathBuf, HostkitError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(HostkitError::ResourceNotFound {
            what: what.to_string(),
            path,
        })
    }
}

/// Kernel image and initramfs inside a kernel build tree.
pub fn kernel_artifacts(arch: Arch, tree: &Path) -> Result<(PathBuf, PathBuf), HostkitError> {
    let kernel = require_file("kernel image", tree.join(arch.kernel_image()))?;
    let initrd = require_file("initramfs", tree.join("rootfs").join("initramfs.img"))?;
    Ok((kernel, initrd))
}
