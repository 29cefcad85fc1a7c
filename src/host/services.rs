//! Small host adjustments around services: libvirt access, growing the root
//! volume, opening the mosh ports and rootless podman id ranges.

use std::path::Path;

use crate::config::HostSettings;
use crate::error::HostkitError;
use crate::host::packages::PackageManager;
use crate::runner::{Cmd, Runner};

const MOSH_PORTS: &str = "60000-61000/udp";
const REGISTRIES: &str = "[registries.search]\nregistries = ['docker.io', 'ghcr.io', 'quay.io']\n";

/// The logical volume mounted at `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootVolume {
    pub device: String,
    pub fs_type: String,
}

/// Root volume from `df -T /` output, when it lives on device-mapper.
pub fn parse_root_volume(df: &str) -> Option<RootVolume> {
    df.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let fs_type = fields.next()?;
        device.starts_with("/dev/mapper/").then(|| RootVolume {
            device: device.to_string(),
            fs_type: fs_type.to_string(),
        })
    })
}

/// Whether `virsh net-info` reports the network as inactive.
pub fn network_inactive(net_info: &str) -> bool {
    net_info.lines().any(|line| {
        line.split_once(':')
            .is_some_and(|(key, value)| key.trim() == "Active" && value.trim() == "no")
    })
}

/// `<user>:100000:65536`, the id range handed to rootless containers.
pub fn subordinate_range(user: &str) -> String {
    format!("{user}:100000:65536\n")
}

pub struct ServiceSetup<'a, R: Runner> {
    runner: &'a R,
    settings: &'a HostSettings,
    on_path: fn(&str) -> bool,
}

impl<'a, R: Runner> ServiceSetup<'a, R> {
    pub fn new(runner: &'a R, settings: &'a HostSettings) -> Self {
        Self {
            runner,
            settings,
            on_path: crate::runner::on_path,
        }
    }

    pub fn path_probe(mut self, on_path: fn(&str) -> bool) -> Self {
        self.on_path = on_path;
        self
    }

    /// Let `user` manage system VMs and bring up the default network.
    /// Returns `false` without changes when virt-install is absent.
    pub async fn libvirt(&self, user: &str) -> Result<bool, HostkitError> {
        let installed = match PackageManager::detect_with(self.on_path) {
            Some(pm) => pm.is_installed(self.runner, "virt-install").await?,
            None => false,
        };
        if !installed {
            tracing::info!("virt-install is not installed, skipping libvirt");
            return Ok(false);
        }

        self.runner
            .output(&Cmd::new("usermod").args(["-aG", "libvirt", user]))
            .await?;
        self.runner
            .output(&Cmd::new("systemctl").args(["enable", "--now", "libvirtd.service"]))
            .await?;
        self.runner
            .output(&Cmd::new("virsh").args(["net-autostart", "default"]))
            .await?;

        let info = self
            .runner
            .output(&Cmd::new("virsh").args(["net-info", "default"]))
            .await?;
        if network_inactive(&info) {
            self.runner
                .output(&Cmd::new("virsh").args(["net-start", "default"]))
                .await?;
        }
        tracing::info!(user, "libvirt ready");
        Ok(true)
    }

    /// Give the root logical volume all free space in its volume group and
    /// grow the filesystem to match.
    pub async fn resize_rootfs(&self) -> Result<Option<RootVolume>, HostkitError> {
        let df = self.runner.output(&Cmd::new("df").args(["-T", "/"])).await?;
        let Some(volume) = parse_root_volume(&df) else {
            tracing::info!("root filesystem is not on a logical volume, skipping");
            return Ok(None);
        };

        let extended = self
            .runner
            .succeeds(&Cmd::new("lvextend").args(["-l", "+100%FREE", volume.device.as_str()]))
            .await?;
        if !extended {
            // lvextend fails when there is nothing left to add.
            tracing::info!(device = %volume.device, "volume not extended");
        }

        match volume.fs_type.as_str() {
            "xfs" => {
                self.runner
                    .output(&Cmd::new("xfs_growfs").arg("/"))
                    .await?;
            }
            "ext4" => {
                self.runner
                    .output(&Cmd::new("resize2fs").arg(&volume.device))
                    .await?;
            }
            other => tracing::warn!(fs_type = other, "not growing filesystem"),
        }
        Ok(Some(volume))
    }

    /// Open the mosh UDP range in firewalld. Returns `false` when firewalld
    /// is not installed.
    pub async fn mosh(&self) -> Result<bool, HostkitError> {
        if !(self.on_path)("firewall-cmd") {
            tracing::info!("firewall-cmd not found, skipping mosh ports");
            return Ok(false);
        }
        self.runner
            .output(
                &Cmd::new("firewall-cmd")
                    .arg(format!("--add-port={MOSH_PORTS}"))
                    .arg("--permanent"),
            )
            .await?;
        self.runner
            .output(&Cmd::new("firewall-cmd").arg("--reload"))
            .await?;
        Ok(true)
    }

    /// Subordinate uid/gid ranges for `user` and a default registry search
    /// list. An existing registries.conf is left alone.
    pub fn podman(&self, user: &str) -> Result<(), HostkitError> {
        let range = subordinate_range(user);
        write_file(&self.settings.subuid, &range)?;
        write_file(&self.settings.subgid, &range)?;

        let registries = &self.settings.registries_conf;
        if !registries.exists() {
            if let Some(parent) = registries.parent() {
                std::fs::create_dir_all(parent).map_err(|e| HostkitError::Io {
                    context: format!("creating {}", parent.display()),
                    source: e,
                })?;
            }
            write_file(registries, REGISTRIES)?;
        }
        tracing::info!(user, "podman id ranges written");
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), HostkitError> {
    std::fs::write(path, contents).map_err(|e| HostkitError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;
    use crate::runner::tests::FakeRunner;

    const DF_XFS: &str = "Filesystem              Type 1K-blocks    Used Available Use% Mounted on
/dev/mapper/fedora-root xfs   15718400 2315580  13402820  15% /
";

    #[test]
    fn root_volume_from_df() {
        assert_eq!(
            parse_root_volume(DF_XFS),
            Some(RootVolume {
                device: "/dev/mapper/fedora-root".into(),
                fs_type: "xfs".into(),
            })
        );
        let plain = "Filesystem Type 1K-blocks Used Available Use% Mounted on\n\
                     /dev/nvme0n1p2 ext4 98831908 40117140 53664776 43% /\n";
        assert_eq!(parse_root_volume(plain), None);
    }

    #[test]
    fn inactive_network_detected() {
        let info = "Name:           default\nActive:         no\nPersistent:     yes\n";
        assert!(network_inactive(info));
        assert!(!network_inactive(&info.replace("Active:         no", "Active:         yes")));
    }

    #[tokio::test]
    async fn libvirt_starts_inactive_network() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().stdout("virsh net-info", "Name: default\nActive: no\n");

        let applied = ServiceSetup::new(&runner, &settings.host)
            .path_probe(|tool| tool == "dnf")
            .libvirt("builder")
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(
            runner.rendered(),
            [
                "dnf list --installed virt-install",
                "usermod -aG libvirt builder",
                "systemctl enable --now libvirtd.service",
                "virsh net-autostart default",
                "virsh net-info default",
                "virsh net-start default",
            ]
        );
    }

    #[tokio::test]
    async fn libvirt_leaves_active_network() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().stdout("virsh net-info", "Active: yes\n");

        ServiceSetup::new(&runner, &settings.host)
            .path_probe(|tool| tool == "dnf")
            .libvirt("builder")
            .await
            .unwrap();

        assert_eq!(runner.rendered().last().unwrap(), "virsh net-info default");
    }

    #[tokio::test]
    async fn libvirt_skipped_without_virt_install() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().fail("dnf list --installed virt-install", 1);

        let applied = ServiceSetup::new(&runner, &settings.host)
            .path_probe(|tool| tool == "dnf")
            .libvirt("builder")
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(runner.rendered(), ["dnf list --installed virt-install"]);
    }

    #[tokio::test]
    async fn resize_grows_xfs_even_when_volume_is_full() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new()
            .stdout("df -T /", DF_XFS)
            .fail("lvextend", 5);

        let volume = ServiceSetup::new(&runner, &settings.host)
            .resize_rootfs()
            .await
            .unwrap();

        assert_eq!(volume.unwrap().device, "/dev/mapper/fedora-root");
        assert_eq!(
            runner.rendered(),
            [
                "df -T /",
                "lvextend -l +100%FREE /dev/mapper/fedora-root",
                "xfs_growfs /",
            ]
        );
    }

    #[tokio::test]
    async fn resize_skips_plain_partitions() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().stdout(
            "df -T /",
            "Filesystem Type 1K-blocks Used Available Use% Mounted on\n/dev/sda2 ext4 1 1 1 1% /",
        );

        let volume = ServiceSetup::new(&runner, &settings.host)
            .resize_rootfs()
            .await
            .unwrap();

        assert!(volume.is_none());
        assert_eq!(runner.rendered(), ["df -T /"]);
    }

    #[tokio::test]
    async fn mosh_opens_udp_range() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new();

        let opened = ServiceSetup::new(&runner, &settings.host)
            .path_probe(|_| true)
            .mosh()
            .await
            .unwrap();

        assert!(opened);
        assert_eq!(
            runner.rendered(),
            [
                "firewall-cmd --add-port=60000-61000/udp --permanent",
                "firewall-cmd --reload",
            ]
        );
    }

    #[tokio::test]
    async fn mosh_skipped_without_firewalld() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new();

        let opened = ServiceSetup::new(&runner, &settings.host)
            .path_probe(|_| false)
            .mosh()
            .await
            .unwrap();

        assert!(!opened);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn podman_writes_ranges_and_default_registries() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new();

        ServiceSetup::new(&runner, &settings.host)
            .podman("builder")
            .unwrap();

        for path in [&settings.host.subuid, &settings.host.subgid] {
            assert_eq!(
                std::fs::read_to_string(path).unwrap(),
                "builder:100000:65536\n"
            );
        }
        assert!(
            std::fs::read_to_string(&settings.host.registries_conf)
                .unwrap()
                .contains("docker.io")
        );
    }

    #[test]
    fn podman_keeps_existing_registries() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        std::fs::create_dir_all(settings.host.registries_conf.parent().unwrap()).unwrap();
        std::fs::write(&settings.host.registries_conf, "# mine\n").unwrap();
        std::fs::write(&settings.host.subuid, "old:1:2\n").unwrap();

        ServiceSetup::new(&FakeRunner::new(), &settings.host)
            .podman("builder")
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&settings.host.registries_conf).unwrap(),
            "# mine\n"
        );
        assert_eq!(
            std::fs::read_to_string(&settings.host.subuid).unwrap(),
            "builder:100000:65536\n"
        );
    }
}
