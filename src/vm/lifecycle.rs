//! `create` → `setup` → `run`.
//!
//! Each step checks the state recorded in the VM directory before touching
//! anything, then shells out and blocks until the tool exits.

use crate::config::Settings;
use crate::error::HostkitError;
use crate::runner::{Cmd, Runner};
use crate::vm::VmSpec;
use crate::vm::dir::{VmDirectory, VmState};
use crate::vm::qemu::{Mode, QemuBuilder, VmArtifacts};
use crate::vm::resources::ResourceLocator;

pub struct VmController<'a, R: Runner> {
    runner: &'a R,
    settings: &'a Settings,
    host_arch: &'a str,
}

impl<'a, R: Runner> VmController<'a, R> {
    pub fn new(runner: &'a R, settings: &'a Settings) -> Self {
        Self {
            runner,
            settings,
            host_arch: crate::util::host_arch(),
        }
    }

    pub fn host_arch(mut self, arch: &'a str) -> Self {
        self.host_arch = arch;
        self
    }

    pub fn directory(&self, spec: &VmSpec) -> Result<VmDirectory, HostkitError> {
        Ok(VmDirectory::locate(self.settings.vm_folder()?, spec))
    }

    /// Recreate the VM directory from scratch: variables store, empty disk,
    /// install media.
    pub async fn create(&self, spec: &VmSpec) -> Result<VmDirectory, HostkitError> {
        let dir = self.directory(spec)?;
        let locator = ResourceLocator::new(spec.arch, &self.settings.vm);

        // Check before wiping anything.
        locator.firmware_vars_template()?;

        dir.reset().await?;
        locator.ensure_firmware_vars(&dir).await?;

        let disk = dir.disk_image();
        self.runner
            .output(
                &Cmd::new("qemu-img")
                    .args(["create", "-f", "qcow2"])
                    .path(&disk)
                    .arg(&spec.disk_size),
            )
            .await?;
        tracing::info!(path = %disk.display(), size = %spec.disk_size, "created disk image");

        locator.ensure_installer(&dir).await?;

        dir.set_state(VmState::Created).await?;
        tracing::info!(vm = %spec.name, path = %dir.path().display(), "VM created");
        Ok(dir)
    }

    /// Boot the installer. Blocks until the emulator exits.
    pub async fn setup(&self, spec: &VmSpec) -> Result<(), HostkitError> {
        let dir = self.directory(spec)?;
        dir.require(&[VmState::Created, VmState::Installed]).await?;

        let locator = ResourceLocator::new(spec.arch, &self.settings.vm);
        let artifacts = self.artifacts(&locator, &dir)?;
        let installer = locator.ensure_installer(&dir).await?;

        let qemu = QemuBuilder::new(spec, &artifacts)
            .host_arch(self.host_arch)
            .ssh_port(self.settings.vm.ssh_port)
            .build(Mode::Setup {
                installer: &installer,
            })?;
        self.boot(spec, qemu.into_cmd()).await?;

        dir.set_state(VmState::Installed).await
    }

    /// Boot the installed system, or the kernel tree in `spec.kernel` when
    /// set. Blocks until the emulator exits.
    pub async fn run(&self, spec: &VmSpec) -> Result<(), HostkitError> {
        let dir = self.directory(spec)?;
        dir.require(&[VmState::Installed]).await?;

        let locator = ResourceLocator::new(spec.arch, &self.settings.vm);
        let artifacts = self.artifacts(&locator, &dir)?;

        let qemu = QemuBuilder::new(spec, &artifacts)
            .host_arch(self.host_arch)
            .ssh_port(self.settings.vm.ssh_port)
            .build(Mode::Run {
                kernel_tree: spec.kernel.as_deref(),
            })?;
        self.boot(spec, qemu.into_cmd()).await
    }

    fn artifacts(
        &self,
        locator: &ResourceLocator<'_>,
        dir: &VmDirectory,
    ) -> Result<VmArtifacts, HostkitError> {
        let disk_image = dir.disk_image();
        if !disk_image.is_file() {
            return Err(HostkitError::ResourceNotFound {
                what: "disk image".into(),
                path: disk_image,
            });
        }
        Ok(VmArtifacts {
            firmware_code: locator.firmware_code()?,
            firmware_vars: locator.existing_firmware_vars(dir)?,
            disk_image,
        })
    }

    async fn boot(&self, spec: &VmSpec, cmd: Cmd) -> Result<(), HostkitError> {
        tracing::info!(vm = %spec.name, state = %VmState::Running, "starting emulator");
        let result = self.runner.attached(&cmd).await;
        tracing::info!(vm = %spec.name, ok = result.is_ok(), "emulator exited");
        result
    }
}
