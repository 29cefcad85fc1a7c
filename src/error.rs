use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HostkitError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VM_FOLDER is undefined")]
    #[diagnostic(help("export VM_FOLDER or set `folder` under [vm] in the config file"))]
    MissingVmFolder,

    #[error("{arch} is not currently supported")]
    UnsupportedArchitecture { arch: String },

    #[error("{what} could not be found: {}", .path.display())]
    ResourceNotFound { what: String, path: PathBuf },

    #[error("precondition failed: {message}")]
    Precondition { message: String },

    #[error("`{command}` exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ExternalCommand {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to download {url}: {message}")]
    Download {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("VM '{name}' is {current}, but this needs it to be {required}")]
    #[diagnostic(help("run the earlier lifecycle step first (create, then setup)"))]
    InvalidState {
        name: String,
        current: String,
        required: String,
    },

    #[error("'{input}' is not a valid IP address")]
    InvalidAddress { input: String },

    #[error("no active ethernet connection found")]
    NoActiveConnection,

    #[error("{ip} is not in any configured subnet")]
    #[diagnostic(help("add an entry under [network.subnets] for its prefix"))]
    UnsupportedSubnet { ip: String },

    #[error(
        "IP address of '{interface}' ('{}') did not change to requested IP address ('{requested}')",
        .observed.as_deref().unwrap_or("none")
    )]
    Verification {
        interface: String,
        requested: String,
        observed: Option<String>,
    },

    #[error("cannot derive a partition name for '{device}' (expected /dev/nvme* or /dev/sd*)")]
    UnrecognizedDeviceNaming { device: String },

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("prompt cancelled")]
    PromptCancelled,
}

impl HostkitError {
    /// Process exit status for this failure. Delegated tools keep their own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            HostkitError::ExternalCommand { code: Some(c), .. } if *c != 0 => *c,
            _ => 1,
        }
    }
}
