//! QEMU virtual machines kept in `<vm folder>/<arch>/<name>/`.

pub mod dir;
pub mod download;
pub mod lifecycle;
pub mod qemu;
pub mod resources;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::HostkitError;
use crate::util::parse_size;

pub const DEFAULT_CORES: u32 = 8;
pub const DEFAULT_MEMORY: &str = "16G";
pub const DEFAULT_DISK_SIZE: &str = "50G";

/// Guest architectures hostkit can resolve firmware and media for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
        }
    }

    pub fn qemu_binary(self) -> String {
        format!("qemu-system-{}", self.as_str())
    }

    /// Read-only UEFI code image shipped by the distribution.
    pub fn firmware_code(self) -> PathBuf {
        match self {
            Arch::X86_64 => PathBuf::from("/usr/share/edk2-ovmf/x64/OVMF_CODE.fd"),
        }
    }

    /// Template for the per-VM UEFI variable store.
    pub fn firmware_vars_template(self) -> PathBuf {
        match self {
            Arch::X86_64 => PathBuf::from("/usr/share/OVMF/x64/OVMF_VARS.fd"),
        }
    }

    /// Kernel image relative to a kernel build tree.
    pub fn kernel_image(self) -> &'static str {
        match self {
            Arch::X86_64 => "arch/x86/boot/bzImage",
        }
    }

    pub fn serial_console(self) -> &'static str {
        match self {
            Arch::X86_64 => "ttyS0",
        }
    }
}

impl FromStr for Arch {
    type Err = HostkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            other => Err(HostkitError::UnsupportedArchitecture {
                arch: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One VM as requested on the command line. Fixed for the whole invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub arch: Arch,
    pub name: String,
    pub cores: u32,
    pub memory: String,
    pub disk_size: String,
    pub kernel: Option<PathBuf>,
}

impl VmSpec {
    /// Architecture is checked first so an unsupported guest is rejected
    /// before anything else is looked at.
    pub fn new(arch: &str, name: &str) -> Result<Self, HostkitError> {
        let arch = arch.parse()?;
        validate_name(name)?;
        Ok(Self {
            arch,
            name: name.to_string(),
            cores: DEFAULT_CORES,
            memory: DEFAULT_MEMORY.to_string(),
            disk_size: DEFAULT_DISK_SIZE.to_string(),
            kernel: None,
        })
    }

    pub fn cores(mut self, cores: u32) -> Result<Self, HostkitError> {
        if cores == 0 {
            return Err(HostkitError::Validation {
                message: "cores must be at least 1".into(),
            });
        }
        self.cores = cores;
        Ok(self)
    }

    pub fn memory(mut self, memory: &str) -> Result<Self, HostkitError> {
        parse_size(memory)?;
        self.memory = memory.trim().to_string();
        Ok(self)
    }

    pub fn disk_size(mut self, size: &str) -> Result<Self, HostkitError> {
        parse_size(size)?;
        self.disk_size = size.trim().to_string();
        Ok(self)
    }

    pub fn kernel(mut self, tree: Option<PathBuf>) -> Self {
        self.kernel = tree;
        self
    }
}

/// VM names become directory names, so keep them to a safe character set.
fn validate_name(name: &str) -> Result<(), HostkitError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(HostkitError::Validation {
            message: format!("VM name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_x86_64_is_supported() {
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X86_64);
        for arch in ["aarch64", "arm64", "riscv64", "i386", "X86_64", ""] {
            assert!(
                matches!(
                    arch.parse::<Arch>(),
                    Err(HostkitError::UnsupportedArchitecture { .. })
                ),
                "expected '{arch}' to be unsupported"
            );
        }
    }

    #[test]
    fn architecture_checked_before_name() {
        let err = VmSpec::new("aarch64", "../../etc").unwrap_err();
        assert!(matches!(err, HostkitError::UnsupportedArchitecture { .. }));
    }

    #[test]
    fn spec_defaults() {
        let spec = VmSpec::new("x86_64", "t1").unwrap();
        assert_eq!(spec.cores, 8);
        assert_eq!(spec.memory, "16G");
        assert_eq!(spec.disk_size, "50G");
        assert!(spec.kernel.is_none());
    }

    #[test]
    fn spec_rejects_bad_resources() {
        let spec = VmSpec::new("x86_64", "t1").unwrap();
        assert!(spec.clone().cores(0).is_err());
        assert!(spec.clone().memory("lots").is_err());
        assert!(spec.disk_size("10Q").is_err());
    }

    #[test]
    fn names_are_path_safe() {
        for good in ["t1", "arch-dev", "vm.test", "VM_01"] {
            VmSpec::new("x86_64", good).unwrap();
        }
        for bad in ["", "-x", ".hidden", "a/b", "..", "with space"] {
            assert!(VmSpec::new("x86_64", bad).is_err(), "'{bad}' accepted");
        }
    }

    #[test]
    fn binary_is_architecture_qualified() {
        assert_eq!(Arch::X86_64.qemu_binary(), "qemu-system-x86_64");
    }
}
