use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::HostkitError;

pub const DEFAULT_INSTALLER: &str =
    "https://mirror.arizona.edu/archlinux/iso/2022.04.01/archlinux-2022.04.01-x86_64.iso";

// ── file format ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct FileConfig {
    #[facet(default)]
    pub vm: VmConfig,
    #[facet(default)]
    pub network: NetworkConfig,
    #[facet(default)]
    pub disk: DiskConfig,
    #[facet(default)]
    pub host: HostConfig,
    #[facet(default)]
    pub user: UserConfig,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    pub folder: Option<String>,
    #[facet(default = "https://mirror.arizona.edu/archlinux/iso/2022.04.01/archlinux-2022.04.01-x86_64.iso")]
    pub installer: String,
    pub firmware_code: Option<String>,
    pub firmware_vars: Option<String>,
    #[facet(default = 8022)]
    pub ssh_port: u16,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            folder: None,
            installer: DEFAULT_INSTALLER.into(),
            firmware_code: None,
            firmware_vars: None,
            ssh_port: 8022,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NetworkConfig {
    /// Keyed by dotted subnet prefix, e.g. `"192.168.4"`.
    #[facet(default)]
    pub subnets: BTreeMap<String, SubnetConfig>,
    /// Hostname → static IP, used when `static-ip` is given no address.
    #[facet(default)]
    pub hosts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Facet)]
pub struct SubnetConfig {
    pub gateway: String,
    pub dns: Vec<String>,
    #[facet(default = 24)]
    pub prefix_len: u8,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DiskConfig {
    #[facet(default = "/etc/fstab")]
    pub fstab: String,
    #[facet(default = "/proc/self/mounts")]
    pub mount_table: String,
    #[facet(default = 30)]
    pub settle_timeout_s: u64,
    #[facet(default = 250)]
    pub poll_interval_ms: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            fstab: "/etc/fstab".into(),
            mount_table: "/proc/self/mounts".into(),
            settle_timeout_s: 30,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HostConfig {
    #[facet(default = "/etc/doas.conf")]
    pub doas_conf: String,
    #[facet(default = "/usr/lib/os-release")]
    pub os_release: String,
    #[facet(default = "/etc/systemd/system")]
    pub systemd_dir: String,
    #[facet(default = "/usr/local")]
    pub prefix: String,
    #[facet(default)]
    pub fedora_versions: Vec<u32>,
    #[facet(default = "/etc/subuid")]
    pub subuid: String,
    #[facet(default = "/etc/subgid")]
    pub subgid: String,
    #[facet(default = "/etc/containers/registries.conf")]
    pub registries_conf: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            doas_conf: "/etc/doas.conf".into(),
            os_release: "/usr/lib/os-release".into(),
            systemd_dir: "/etc/systemd/system".into(),
            prefix: "/usr/local".into(),
            fedora_versions: Vec::new(),
            subuid: "/etc/subuid".into(),
            subgid: "/etc/subgid".into(),
            registries_conf: "/etc/containers/registries.conf".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct UserConfig {
    pub name: Option<String>,
}

// ── resolved settings ─────────────────────────────────────

/// Process environment captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub vm_folder: Option<String>,
    pub username: Option<String>,
    pub prefix: Option<String>,
}

impl Environment {
    pub fn capture() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            vm_folder: var("VM_FOLDER"),
            username: var("USERNAME"),
            prefix: var("PREFIX"),
        }
    }
}

/// Gateway and DNS policy for one subnet prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPolicy {
    pub prefix: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub prefix_len: u8,
}

#[derive(Debug, Clone)]
pub struct VmSettings {
    pub folder: Option<PathBuf>,
    pub installer: String,
    pub firmware_code: Option<PathBuf>,
    pub firmware_vars: Option<PathBuf>,
    pub ssh_port: u16,
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub subnets: Vec<SubnetPolicy>,
    pub hosts: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DiskSettings {
    pub fstab: PathBuf,
    pub mount_table: PathBuf,
    pub settle_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub doas_conf: PathBuf,
    pub os_release: PathBuf,
    pub systemd_dir: PathBuf,
    pub prefix: PathBuf,
    pub fedora_versions: Vec<u32>,
    pub subuid: PathBuf,
    pub subgid: PathBuf,
    pub registries_conf: PathBuf,
}

/// Everything hostkit reads from outside: config file plus environment.
/// Built once in `main` and passed down.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vm: VmSettings,
    pub network: NetworkSettings,
    pub disk: DiskSettings,
    pub host: HostSettings,
    pub user: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Root under which `<arch>/<name>` VM directories live.
    pub fn vm_folder(&self) -> Result<&Path, HostkitError> {
        self.vm.folder.as_deref().ok_or(HostkitError::MissingVmFolder)
    }

    /// Target user for ownership changes; an explicit value wins.
    pub fn user(&self, explicit: Option<&str>) -> Result<String, HostkitError> {
        explicit
            .map(str::to_string)
            .or_else(|| self.user.clone())
            .ok_or_else(|| HostkitError::Validation {
                message: "no user given: pass --user, export USERNAME, or set [user] name".into(),
            })
    }

    pub fn resolve(file: FileConfig, env: &Environment) -> Result<Self, HostkitError> {
        validate_config(&file)?;

        let mut subnets = builtin_subnets();
        for (prefix, s) in file.network.subnets {
            let policy = SubnetPolicy {
                prefix,
                gateway: s.gateway,
                dns: s.dns,
                prefix_len: s.prefix_len,
            };
            match subnets.iter_mut().find(|p| p.prefix == policy.prefix) {
                Some(existing) => *existing = policy,
                None => subnets.push(policy),
            }
        }

        let fedora_versions = if file.host.fedora_versions.is_empty() {
            vec![35, 36, 37]
        } else {
            file.host.fedora_versions
        };

        Ok(Self {
            vm: VmSettings {
                folder: env
                    .vm_folder
                    .clone()
                    .or(file.vm.folder)
                    .map(PathBuf::from),
                installer: file.vm.installer,
                firmware_code: file.vm.firmware_code.map(PathBuf::from),
                firmware_vars: file.vm.firmware_vars.map(PathBuf::from),
                ssh_port: file.vm.ssh_port,
            },
            network: NetworkSettings {
                subnets,
                hosts: file.network.hosts,
            },
            disk: DiskSettings {
                fstab: PathBuf::from(file.disk.fstab),
                mount_table: PathBuf::from(file.disk.mount_table),
                settle_timeout: Duration::from_secs(file.disk.settle_timeout_s),
                poll_interval: Duration::from_millis(file.disk.poll_interval_ms),
            },
            host: HostSettings {
                doas_conf: PathBuf::from(file.host.doas_conf),
                os_release: PathBuf::from(file.host.os_release),
                systemd_dir: PathBuf::from(file.host.systemd_dir),
                prefix: PathBuf::from(env.prefix.clone().unwrap_or(file.host.prefix)),
                fedora_versions,
                subuid: PathBuf::from(file.host.subuid),
                subgid: PathBuf::from(file.host.subgid),
                registries_conf: PathBuf::from(file.host.registries_conf),
            },
            user: env.username.clone().or(file.user.name),
            log_file: file.log_file.map(PathBuf::from).or_else(default_log_file),
        })
    }
}

/// The one subnet hostkit knows about without configuration.
fn builtin_subnets() -> Vec<SubnetPolicy> {
    vec![SubnetPolicy {
        prefix: "192.168.4".into(),
        gateway: "192.168.4.1".into(),
        dns: ["8.8.8.8", "8.8.4.4", "1.1.1.1", "192.168.0.1"]
            .map(String::from)
            .to_vec(),
        prefix_len: 24,
    }]
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &FileConfig) -> Result<(), HostkitError> {
    let fail = |message: String| Err(HostkitError::Validation { message });

    if config.vm.folder.as_deref() == Some("") {
        return fail("vm.folder must not be empty".into());
    }
    if config.vm.installer.trim().is_empty() {
        return fail("vm.installer must not be empty".into());
    }
    if config.vm.ssh_port == 0 {
        return fail("vm.ssh_port must not be 0".into());
    }

    for (prefix, subnet) in &config.network.subnets {
        if !is_subnet_prefix(prefix) {
            return fail(format!(
                "network.subnets: '{prefix}' is not a dotted IPv4 prefix like '192.168.4'"
            ));
        }
        if subnet.gateway.parse::<IpAddr>().is_err() {
            return fail(format!(
                "network.subnets.{prefix}: invalid gateway '{}'",
                subnet.gateway
            ));
        }
        if let Some(bad) = subnet.dns.iter().find(|d| d.parse::<IpAddr>().is_err()) {
            return fail(format!("network.subnets.{prefix}: invalid dns server '{bad}'"));
        }
        if subnet.prefix_len == 0 || subnet.prefix_len > 32 {
            return fail(format!(
                "network.subnets.{prefix}: prefix_len must be 1-32 (got {})",
                subnet.prefix_len
            ));
        }
    }

    for (host, ip) in &config.network.hosts {
        if ip.parse::<IpAddr>().is_err() {
            return fail(format!("network.hosts.{host}: invalid address '{ip}'"));
        }
    }

    if config.disk.settle_timeout_s == 0 {
        return fail("disk.settle_timeout_s must be at least 1".into());
    }
    if config.disk.poll_interval_ms == 0 {
        return fail("disk.poll_interval_ms must be at least 1".into());
    }

    if config.user.name.as_deref() == Some("") {
        return fail("user.name must not be empty".into());
    }

    Ok(())
}

/// One to three dot-separated decimal octets.
fn is_subnet_prefix(s: &str) -> bool {
    let octets: Vec<&str> = s.split('.').collect();
    (1..=3).contains(&octets.len())
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.parse::<u8>().is_ok())
}

// ── helpers ───────────────────────────────────────────────

/// `~/.config/hostkit/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hostkit").join("config.toml"))
}

/// `~/.local/state/hostkit/hostkit.log`, falling back to the local data dir.
fn default_log_file() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("hostkit").join("hostkit.log"))
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, origin: &Path) -> Result<FileConfig, HostkitError> {
    facet_toml::from_str(contents).map_err(|e| HostkitError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })
}

/// Load settings. An explicit path must exist; without one the default
/// location is used if present, otherwise built-in defaults.
pub fn load_settings(explicit: Option<&Path>, env: &Environment) -> Result<Settings, HostkitError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.is_file()),
    };

    let file = match path {
        Some(path) => {
            let contents =
                std::fs::read_to_string(&path).map_err(|source| HostkitError::ConfigLoad {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing::debug!(path = %path.display(), "loaded config");
            parse_config(&contents, &path)?
        }
        None => FileConfig::default(),
    };

    Settings::resolve(file, env)
}
