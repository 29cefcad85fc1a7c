use std::collections::BTreeMap;
use std::path::Path;

use crate::config::HostSettings;
use crate::error::HostkitError;

/// Parsed `os-release` key/value pairs with quotes removed.
#[derive(Debug, Clone, Default)]
pub struct OsRelease {
    values: BTreeMap<String, String>,
}

impl OsRelease {
    pub fn parse(contents: &str) -> Self {
        let values = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches(['"', '\'']).to_string()))
            .collect();
        Self { values }
    }

    pub fn load(path: &Path) -> Result<Self, HostkitError> {
        let contents = std::fs::read_to_string(path).map_err(|e| HostkitError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        Ok(Self::parse(&contents))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }
}

pub fn effective_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

pub fn require_root(euid: u32) -> Result<(), HostkitError> {
    if euid == 0 {
        Ok(())
    } else {
        Err(HostkitError::Precondition {
            message: "root access is required".into(),
        })
    }
}

/// Fedora releases outside the supported list are refused; other
/// distributions pass through.
pub fn check_release(release: &OsRelease, fedora_versions: &[u32]) -> Result<(), HostkitError> {
    if release.id() != Some("fedora") {
        return Ok(());
    }
    let raw = release.get("VERSION_ID").unwrap_or_default();
    let version: u32 = raw.parse().map_err(|_| HostkitError::Precondition {
        message: format!("cannot read Fedora VERSION_ID '{raw}'"),
    })?;
    if fedora_versions.contains(&version) {
        Ok(())
    } else {
        Err(HostkitError::Precondition {
            message: format!(
                "Fedora {version} is not tested with hostkit (supported: {})",
                fedora_versions
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

/// Root check followed by the release check.
pub fn run(settings: &HostSettings, euid: u32) -> Result<OsRelease, HostkitError> {
    require_root(euid)?;
    let release = OsRelease::load(&settings.os_release)?;
    check_release(&release, &settings.fedora_versions)?;
    tracing::info!(
        id = release.id().unwrap_or("unknown"),
        version = release.get("VERSION_ID").unwrap_or("unknown"),
        "preflight passed"
    );
    Ok(release)
}
