//! Replace sudo with doas: persist for wheel, passwordless root, and a
//! stow-managed `sudo` symlink for scripts that still call it.

use std::path::{Path, PathBuf};

use crate::config::HostSettings;
use crate::error::HostkitError;
use crate::host::packages::PackageManager;
use crate::runner::{Cmd, Runner};

const PROTECTED_SUDO: &str = "/etc/dnf/protected.d/sudo.conf";

/// New doas.conf text, or `None` when it already has the persist rule.
pub fn rewrite_doas_conf(current: &str) -> Option<String> {
    const PERSIST: &str = "permit persist :wheel";
    if current.contains(PERSIST) {
        return None;
    }
    let mut text = current.replace("permit :wheel", PERSIST);
    text.push_str("\n# Do not require root to put in a password (makes no sense)\n");
    text.push_str("permit nopass root\n");
    Some(text)
}

pub struct DoasSetup<'a, R: Runner> {
    runner: &'a R,
    doas_conf: PathBuf,
    protected_sudo: PathBuf,
    prefix: PathBuf,
    packages: Option<PackageManager>,
    doas_binary: Option<PathBuf>,
}

impl<'a, R: Runner> DoasSetup<'a, R> {
    pub fn new(runner: &'a R, settings: &HostSettings) -> Self {
        Self {
            runner,
            doas_conf: settings.doas_conf.clone(),
            protected_sudo: PathBuf::from(PROTECTED_SUDO),
            prefix: settings.prefix.clone(),
            packages: PackageManager::detect(),
            doas_binary: which::which("doas").ok(),
        }
    }

    pub fn protected_sudo(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected_sudo = path.into();
        self
    }

    pub fn packages(mut self, packages: Option<PackageManager>) -> Self {
        self.packages = packages;
        self
    }

    pub fn doas_binary(mut self, path: Option<PathBuf>) -> Self {
        self.doas_binary = path;
        self
    }

    /// `<prefix>/stow/sudo/bin/sudo`
    pub fn sudo_link(&self) -> PathBuf {
        self.prefix.join("stow").join("sudo").join("bin").join("sudo")
    }

    pub async fn apply(&self) -> Result<(), HostkitError> {
        let doas = self
            .doas_binary
            .clone()
            .ok_or_else(|| HostkitError::Precondition {
                message: "doas is not installed".into(),
            })?;

        self.update_conf()?;

        match std::fs::remove_file(&self.protected_sudo) {
            Ok(()) => tracing::info!(path = %self.protected_sudo.display(), "removed sudo protection"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HostkitError::Io {
                    context: format!("removing {}", self.protected_sudo.display()),
                    source: e,
                });
            }
        }

        match self.packages {
            Some(pm) => {
                pm.remove_if_installed(self.runner, "sudo").await?;
            }
            None => tracing::warn!("no known package manager, leaving sudo installed"),
        }

        self.link_sudo(&doas).await
    }

    fn update_conf(&self) -> Result<(), HostkitError> {
        let path = &self.doas_conf;
        let current = std::fs::read_to_string(path).map_err(|e| HostkitError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        match rewrite_doas_conf(&current) {
            Some(text) => {
                std::fs::write(path, text).map_err(|e| HostkitError::Io {
                    context: format!("writing {}", path.display()),
                    source: e,
                })?;
                tracing::info!(path = %path.display(), "updated doas config");
            }
            None => tracing::debug!(path = %path.display(), "doas config already up to date"),
        }
        Ok(())
    }

    async fn link_sudo(&self, doas: &Path) -> Result<(), HostkitError> {
        let link = self.sudo_link();
        if let Some(bin) = link.parent() {
            std::fs::create_dir_all(bin).map_err(|e| HostkitError::Io {
                context: format!("creating {}", bin.display()),
                source: e,
            })?;
        }
        match std::os::unix::fs::symlink(doas, &link) {
            Ok(()) => tracing::info!(link = %link.display(), target = %doas.display(), "linked sudo to doas"),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(HostkitError::Io {
                    context: format!("linking {}", link.display()),
                    source: e,
                });
            }
        }

        self.runner
            .output(
                &Cmd::new("stow")
                    .arg("-d")
                    .path(&self.prefix.join("stow"))
                    .args(["-R", "sudo", "-v"]),
            )
            .await
            .map(|_| ())
    }
}
