//! QEMU command line assembly.
//!
//! Building an invocation never runs anything; the result is handed to a
//! [`Runner`](crate::runner::Runner) as a [`Cmd`].

use std::path::{Path, PathBuf};

use crate::error::HostkitError;
use crate::runner::Cmd;
use crate::vm::VmSpec;
use crate::vm::resources::kernel_artifacts;

/// Ordered QEMU tokens, binary first. Only grows while being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuInvocation {
    tokens: Vec<String>,
}

impl QemuInvocation {
    fn new(binary: String) -> Self {
        Self {
            tokens: vec![binary],
        }
    }

    fn flag(&mut self, flag: &str) {
        self.tokens.push(flag.to_string());
    }

    fn opt(&mut self, flag: &str, value: impl Into<String>) {
        self.tokens.push(flag.to_string());
        self.tokens.push(value.into());
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_cmd(self) -> Cmd {
        let mut tokens = self.tokens.into_iter();
        let program = tokens.next().unwrap_or_default();
        Cmd::new(program).args(tokens)
    }
}

/// Paths inside the VM directory the emulator needs in every mode.
#[derive(Debug, Clone)]
pub struct VmArtifacts {
    pub firmware_code: PathBuf,
    pub firmware_vars: PathBuf,
    pub disk_image: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub enum Mode<'a> {
    /// First boot from the install media.
    Setup { installer: &'a Path },
    /// Normal boot, optionally straight into a kernel build tree.
    Run { kernel_tree: Option<&'a Path> },
}

pub struct QemuBuilder<'a> {
    spec: &'a VmSpec,
    artifacts: &'a VmArtifacts,
    host_arch: &'a str,
    ssh_port: u16,
}

impl<'a> QemuBuilder<'a> {
    pub fn new(spec: &'a VmSpec, artifacts: &'a VmArtifacts) -> Self {
        Self {
            spec,
            artifacts,
            host_arch: crate::util::host_arch(),
            ssh_port: 8022,
        }
    }

    /// Host architecture used to decide on KVM acceleration.
    pub fn host_arch(mut self, arch: &'a str) -> Self {
        self.host_arch = arch;
        self
    }

    /// Host port forwarded to guest port 22.
    pub fn ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn build(&self, mode: Mode<'_>) -> Result<QemuInvocation, HostkitError> {
        let spec = self.spec;
        let mut qemu = QemuInvocation::new(spec.arch.qemu_binary());

        // No display
        qemu.opt("-display", "none");
        qemu.opt("-serial", "mon:stdio");

        // Firmware
        qemu.opt(
            "-drive",
            format!(
                "if=pflash,format=raw,file={},readonly=on",
                self.artifacts.firmware_code.display()
            ),
        );
        qemu.opt(
            "-drive",
            format!(
                "if=pflash,format=raw,file={}",
                self.artifacts.firmware_vars.display()
            ),
        );

        // Hard drive
        qemu.opt(
            "-drive",
            format!(
                "if=virtio,format=qcow2,file={}",
                self.artifacts.disk_image.display()
            ),
        );

        if self.host_arch == spec.arch.as_str() {
            qemu.opt("-cpu", "host");
            qemu.flag("-enable-kvm");
        }

        qemu.opt("-m", spec.memory.as_str());
        qemu.opt(
            "-nic",
            format!(
                "user,model=virtio-net-pci,hostfwd=tcp::{}-:22",
                self.ssh_port
            ),
        );
        qemu.opt("-smp", spec.cores.to_string());

        match mode {
            Mode::Setup { installer } => {
                qemu.opt("-device", "virtio-scsi-pci,id=scsi0");
                qemu.opt("-device", "scsi-cd,drive=cd");
                qemu.opt(
                    "-drive",
                    format!("if=none,format=raw,id=cd,file={}", installer.display()),
                );
            }
            Mode::Run {
                kernel_tree: Some(tree),
            } => {
                let (kernel, initrd) = kernel_artifacts(spec.arch, tree)?;
                qemu.opt(
                    "-append",
                    format!(
                        "root=/dev/vda2 rw rootfstype=ext4 console={}",
                        spec.arch.serial_console()
                    ),
                );
                qemu.opt("-kernel", kernel.display().to_string());
                qemu.opt("-initrd", initrd.display().to_string());
            }
            Mode::Run { kernel_tree: None } => {}
        }

        Ok(qemu)
    }
}
