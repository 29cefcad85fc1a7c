use std::path::{Path, PathBuf};

use crate::error::HostkitError;
use crate::runner::{Cmd, Runner};

pub struct UserProvisioner<'a, R: Runner> {
    runner: &'a R,
    ssh_source: PathBuf,
    home_root: PathBuf,
}

impl<'a, R: Runner> UserProvisioner<'a, R> {
    /// Copies the invoking user's `~/.ssh` into new accounts under `/home`.
    pub fn new(runner: &'a R) -> Result<Self, HostkitError> {
        let home = dirs::home_dir().ok_or_else(|| HostkitError::Precondition {
            message: "cannot determine the current home directory".into(),
        })?;
        Ok(Self::with_paths(runner, home.join(".ssh"), "/home"))
    }

    pub fn with_paths(
        runner: &'a R,
        ssh_source: impl Into<PathBuf>,
        home_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            ssh_source: ssh_source.into(),
            home_root: home_root.into(),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, HostkitError> {
        self.runner
            .succeeds(&Cmd::new("getent").args(["passwd", name]))
            .await
    }

    /// `sudo` where the distribution has it, `wheel` otherwise.
    async fn admin_group(&self) -> Result<&'static str, HostkitError> {
        let has_sudo = self
            .runner
            .succeeds(&Cmd::new("getent").args(["group", "sudo"]))
            .await?;
        Ok(if has_sudo { "sudo" } else { "wheel" })
    }

    /// Create `name` in the admin group with `password` and root's SSH keys.
    pub async fn create(&self, name: &str, password: &str) -> Result<PathBuf, HostkitError> {
        if self.exists(name).await? {
            return Err(HostkitError::Precondition {
                message: format!("user ('{name}') already exists"),
            });
        }
        if !self.ssh_source.is_dir() {
            return Err(HostkitError::ResourceNotFound {
                what: "ssh directory to copy".into(),
                path: self.ssh_source.clone(),
            });
        }

        let group = self.admin_group().await?;
        self.runner
            .output(&Cmd::new("useradd").args(["-m", "-G", group, name]))
            .await?;
        self.runner
            .output(&Cmd::new("chpasswd").stdin(format!("{name}:{password}")))
            .await?;
        tracing::info!(user = name, group, "created user");

        let user_ssh = self.home_root.join(name).join(".ssh");
        self.runner
            .output(&Cmd::new("cp").arg("-a").path(&self.ssh_source).path(&user_ssh))
            .await?;
        chown_recursive(self.runner, name, &user_ssh).await?;
        Ok(user_ssh)
    }
}

pub async fn chown_recursive<R: Runner>(
    runner: &R,
    user: &str,
    path: &Path,
) -> Result<(), HostkitError> {
    runner
        .output(
            &Cmd::new("chown")
                .arg("-R")
                .arg(format!("{user}:{user}"))
                .path(path),
        )
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::FakeRunner;

    fn provisioner<'a>(runner: &'a FakeRunner, root: &Path) -> UserProvisioner<'a, FakeRunner> {
        let ssh = root.join("root-ssh");
        std::fs::create_dir_all(&ssh).unwrap();
        UserProvisioner::with_paths(runner, ssh, root.join("home"))
    }

    #[tokio::test]
    async fn existing_user_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let err = provisioner(&runner, root.path())
            .create("builder", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::Precondition { .. }));
        assert_eq!(runner.rendered(), ["getent passwd builder"]);
    }

    #[tokio::test]
    async fn creates_in_wheel_without_sudo_group() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new()
            .fail("getent passwd", 2)
            .fail("getent group sudo", 2);
        let ssh = provisioner(&runner, root.path())
            .create("builder", "hunter2")
            .await
            .unwrap();

        assert_eq!(ssh, root.path().join("home/builder/.ssh"));
        let rendered = runner.rendered();
        assert_eq!(rendered[2], "useradd -m -G wheel builder");
        assert_eq!(rendered[3], "chpasswd");
        assert!(rendered[4].starts_with("cp -a "));
        assert!(rendered[5].starts_with("chown -R builder:builder "));
        assert!(!rendered.iter().any(|c| c.contains("hunter2")));
    }

    #[tokio::test]
    async fn password_goes_through_stdin() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new().fail("getent passwd", 2);
        provisioner(&runner, root.path())
            .create("builder", "hunter2")
            .await
            .unwrap();
        let calls = runner.calls();
        let chpasswd = calls.iter().find(|c| c.program() == "chpasswd").unwrap();
        assert_eq!(chpasswd, &Cmd::new("chpasswd").stdin("builder:hunter2"));
        assert!(runner.rendered().contains(&"useradd -m -G sudo builder".to_string()));
    }

    #[tokio::test]
    async fn missing_ssh_source_fails_before_useradd() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new().fail("getent passwd", 2);
        let err = UserProvisioner::with_paths(&runner, root.path().join("nope"), root.path())
            .create("builder", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::ResourceNotFound { .. }));
        assert!(!runner.rendered().iter().any(|c| c.starts_with("useradd")));
    }
}
