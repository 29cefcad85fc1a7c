//! Which package manager is on this host, and the handful of verbs hostkit needs.

use crate::error::HostkitError;
use crate::runner::{Cmd, Runner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pacman,
    Dnf,
    Apt,
}

impl PackageManager {
    /// Probe `PATH` in the order pacman, dnf, dpkg.
    pub fn detect() -> Option<Self> {
        Self::detect_with(crate::runner::on_path)
    }

    pub fn detect_with(on_path: impl Fn(&str) -> bool) -> Option<Self> {
        if on_path("pacman") {
            Some(PackageManager::Pacman)
        } else if on_path("dnf") {
            Some(PackageManager::Dnf)
        } else if on_path("dpkg") {
            Some(PackageManager::Apt)
        } else {
            None
        }
    }

    fn query(self, package: &str) -> Cmd {
        match self {
            PackageManager::Pacman => Cmd::new("pacman").arg("-Q").arg(package),
            PackageManager::Dnf => Cmd::new("dnf").args(["list", "--installed", package]),
            PackageManager::Apt => Cmd::new("dpkg").arg("-s").arg(package),
        }
    }

    pub async fn is_installed<R: Runner>(
        self,
        runner: &R,
        package: &str,
    ) -> Result<bool, HostkitError> {
        runner.succeeds(&self.query(package)).await
    }

    pub async fn install<R: Runner>(
        self,
        runner: &R,
        packages: &[&str],
    ) -> Result<(), HostkitError> {
        match self {
            PackageManager::Pacman => {
                runner
                    .output(&Cmd::new("pacman").args(["-Syyu", "--noconfirm"]).args(packages))
                    .await?;
            }
            PackageManager::Dnf => {
                runner
                    .output(&Cmd::new("dnf").args(["install", "-y"]).args(packages))
                    .await?;
            }
            PackageManager::Apt => {
                runner.output(&Cmd::new("apt").arg("update")).await?;
                runner
                    .output(&Cmd::new("apt").args(["install", "-y"]).args(packages))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn remove_if_installed<R: Runner>(
        self,
        runner: &R,
        package: &str,
    ) -> Result<bool, HostkitError> {
        if !self.is_installed(runner, package).await? {
            return Ok(false);
        }
        let cmd = match self {
            PackageManager::Pacman => Cmd::new("pacman").args(["-R", "--noconfirm", package]),
            PackageManager::Dnf => Cmd::new("dnf").args(["remove", "-y", package]),
            PackageManager::Apt => Cmd::new("apt").args(["remove", "-y", package]),
        };
        runner.output(&cmd).await?;
        tracing::info!(package, "removed package");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::FakeRunner;

    #[test]
    fn detection_prefers_pacman_then_dnf() {
        assert_eq!(
            PackageManager::detect_with(|_| true),
            Some(PackageManager::Pacman)
        );
        assert_eq!(
            PackageManager::detect_with(|p| p == "dnf" || p == "dpkg"),
            Some(PackageManager::Dnf)
        );
        assert_eq!(
            PackageManager::detect_with(|p| p == "dpkg"),
            Some(PackageManager::Apt)
        );
        assert_eq!(PackageManager::detect_with(|_| false), None);
    }

    #[tokio::test]
    async fn remove_skips_missing_package() {
        let runner = FakeRunner::new().fail("dpkg -s sudo", 1);
        let removed = PackageManager::Apt
            .remove_if_installed(&runner, "sudo")
            .await
            .unwrap();
        assert!(!removed);
        assert_eq!(runner.rendered(), ["dpkg -s sudo"]);
    }

    #[tokio::test]
    async fn remove_installed_package() {
        let runner = FakeRunner::new();
        let removed = PackageManager::Dnf
            .remove_if_installed(&runner, "sudo")
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(
            runner.rendered(),
            ["dnf list --installed sudo", "dnf remove -y sudo"]
        );
    }

    #[tokio::test]
    async fn apt_install_updates_first() {
        let runner = FakeRunner::new();
        PackageManager::Apt
            .install(&runner, &["parted"])
            .await
            .unwrap();
        assert_eq!(runner.rendered(), ["apt update", "apt install -y parted"]);
    }
}
