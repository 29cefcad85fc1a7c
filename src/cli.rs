use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::vm::{DEFAULT_CORES, DEFAULT_DISK_SIZE, DEFAULT_MEMORY};

#[derive(Parser, Debug)]
#[command(
    name = "hostkit",
    version,
    about = "QEMU VM launcher and host provisioning helpers"
)]
pub struct Cli {
    /// Path to config file (default: ~/.config/hostkit/config.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage QEMU virtual machines under $VM_FOLDER
    Vm {
        #[command(subcommand)]
        action: VmCommand,
    },

    /// Configure the machine hostkit runs on
    Host {
        #[command(subcommand)]
        action: HostCommand,
    },
}

/// Selects one VM directory.
#[derive(Args, Debug)]
pub struct VmTarget {
    /// Guest architecture (default: host architecture)
    #[arg(short, long, default_value_t = crate::util::host_arch().to_string())]
    pub arch: String,

    /// VM name
    #[arg(short, long)]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct VmResources {
    /// Number of virtual CPUs
    #[arg(short, long, default_value_t = DEFAULT_CORES)]
    pub cores: u32,

    /// Guest memory, e.g. 16G
    #[arg(short, long, default_value = DEFAULT_MEMORY)]
    pub memory: String,
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// Wipe and recreate the VM directory with a fresh disk image
    Create {
        #[command(flatten)]
        target: VmTarget,

        /// Disk image size, e.g. 50G
        #[arg(short, long, default_value = DEFAULT_DISK_SIZE)]
        size: String,
    },

    /// Boot the installer attached to the terminal
    Setup {
        #[command(flatten)]
        target: VmTarget,

        #[command(flatten)]
        resources: VmResources,
    },

    /// Boot the installed VM attached to the terminal
    Run {
        #[command(flatten)]
        target: VmTarget,

        #[command(flatten)]
        resources: VmResources,

        /// Kernel build tree to boot directly (bzImage + rootfs/initramfs.img)
        #[arg(short, long)]
        kernel: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    /// Move the active wired connection to a static IP
    StaticIp {
        /// Address to assign (default: this host's entry in [network.hosts])
        ip: Option<String>,
    },

    /// Partition a blank drive, add it to fstab and mount it
    Partition {
        /// Whole-disk device, e.g. /dev/nvme1n1 or /dev/sdb
        #[arg(short, long)]
        device: String,

        /// Mountpoint for the new partition
        #[arg(short = 'f', long, default_value = "/home")]
        folder: PathBuf,

        /// Owner of the mountpoint (default: $USERNAME or [user] name)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Create an admin user with root's SSH keys
    CreateUser {
        /// Account name (default: $USERNAME or [user] name)
        #[arg(short, long)]
        user: Option<String>,

        /// Password (prompted for when omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Replace sudo with doas
    Doas,

    /// Install and enable systemd mount units
    MountUnits {
        /// Directory holding the unit files
        #[arg(long, default_value = ".")]
        from: PathBuf,

        /// Unit file names, e.g. mnt-nas.mount mnt-nas.automount
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Check for root and a supported OS release
    Preflight,

    /// Give a user libvirt access and autostart the default network
    Libvirt {
        /// User to add to the libvirt group (default: $USERNAME or [user] name)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Grow the root logical volume and its filesystem into free space
    ResizeRootfs,

    /// Open the mosh UDP ports in firewalld
    Mosh,

    /// Write subordinate id ranges for rootless podman
    Podman {
        /// User that runs containers (default: $USERNAME or [user] name)
        #[arg(short, long)]
        user: Option<String>,
    },
}
