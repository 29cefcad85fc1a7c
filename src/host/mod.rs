//! Host provisioning steps. Each one is a short sequence of system tools run
//! through a [`Runner`](crate::runner::Runner); none of them retry.

pub mod disk;
pub mod doas;
pub mod network;
pub mod packages;
pub mod preflight;
pub mod services;
pub mod units;
pub mod users;

use crate::error::HostkitError;

/// Fail unless every tool in `tools` resolves through `on_path`.
pub fn require_tools(tools: &[&str], on_path: fn(&str) -> bool) -> Result<(), HostkitError> {
    let missing: Vec<&str> = tools.iter().copied().filter(|t| !on_path(t)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HostkitError::Precondition {
            message: format!("required tools not found on PATH: {}", missing.join(", ")),
        })
    }
}
