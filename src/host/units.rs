use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::HostkitError;
use crate::runner::{Cmd, Runner};

fn is_mount_unit(name: &str) -> bool {
    name.ends_with(".mount") || name.ends_with(".automount")
}

/// Units to `enable --now`: the automount units when any are present, since
/// each pulls in its mount; otherwise every unit given.
pub fn units_to_enable(units: &[String]) -> Vec<&str> {
    let automounts: Vec<&str> = units
        .iter()
        .map(String::as_str)
        .filter(|u| u.ends_with(".automount"))
        .collect();
    if automounts.is_empty() {
        units.iter().map(String::as_str).collect()
    } else {
        automounts
    }
}

/// Copy `units` from `source_dir` into `systemd_dir` with mode 0644 and
/// enable them.
pub async fn install_mount_units<R: Runner>(
    runner: &R,
    source_dir: &Path,
    systemd_dir: &Path,
    units: &[String],
) -> Result<Vec<PathBuf>, HostkitError> {
    if units.is_empty() {
        return Err(HostkitError::Validation {
            message: "no units given".into(),
        });
    }
    if let Some(bad) = units.iter().find(|u| !is_mount_unit(u) || u.contains('/')) {
        return Err(HostkitError::Validation {
            message: format!("'{bad}' is not a .mount or .automount unit name"),
        });
    }

    let mut installed = Vec::with_capacity(units.len());
    for unit in units {
        let src = source_dir.join(unit);
        if !src.is_file() {
            return Err(HostkitError::ResourceNotFound {
                what: format!("unit {unit}"),
                path: src,
            });
        }
        let dst = systemd_dir.join(unit);
        std::fs::copy(&src, &dst).map_err(|e| HostkitError::Io {
            context: format!("copying {} to {}", src.display(), dst.display()),
            source: e,
        })?;
        std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o644)).map_err(|e| {
            HostkitError::Io {
                context: format!("setting mode on {}", dst.display()),
                source: e,
            }
        })?;
        tracing::info!(unit = %unit, path = %dst.display(), "installed unit");
        installed.push(dst);
    }

    runner
        .output(
            &Cmd::new("systemctl")
                .args(["enable", "--now"])
                .args(units_to_enable(units)),
        )
        .await?;
    Ok(installed)
}
