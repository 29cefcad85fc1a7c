//! Static IP migration of the active wired NetworkManager profile.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::{NetworkSettings, SubnetPolicy};
use crate::error::HostkitError;
use crate::host::require_tools;
use crate::runner::{Cmd, Runner};

/// An active NetworkManager profile and the device it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConnection {
    pub name: String,
    pub interface: String,
    pub current_ip: Option<IpAddr>,
}

/// Split one line of `nmcli -t` output. Colons escaped as `\:` belong to the field.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => field.extend(chars.next()),
            ':' => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// First row of `nmcli -f TYPE,NAME,DEVICE -t connection show --active`
/// whose type mentions ethernet.
pub fn parse_active_ethernet(output: &str) -> Option<(String, String)> {
    output.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [kind, name, device, ..] if kind.contains("ethernet") && !device.is_empty() => {
                Some((name.clone(), device.clone()))
            }
            _ => None,
        }
    })
}

/// First IPv4 address in `ip -o -4 addr show dev <intf>` output.
pub fn parse_ipv4(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "inet")?;
        let cidr = words.next()?;
        cidr.split('/').next()?.parse().ok()
    })
}

/// Policy whose dotted prefix covers `ip` on an octet boundary.
pub fn policy_for<'a>(ip: &IpAddr, subnets: &'a [SubnetPolicy]) -> Option<&'a SubnetPolicy> {
    let IpAddr::V4(v4) = ip else {
        return None;
    };
    let text = v4.to_string();
    subnets
        .iter()
        .filter(|p| text.starts_with(&format!("{}.", p.prefix)))
        .max_by_key(|p| p.prefix.len())
}

/// Address to assign: the explicit one, else this host's entry in `hosts`.
pub fn resolve_target(
    explicit: Option<&str>,
    hostname: &str,
    hosts: &BTreeMap<String, String>,
) -> Result<String, HostkitError> {
    if let Some(ip) = explicit {
        return Ok(ip.to_string());
    }
    hosts
        .get(hostname)
        .cloned()
        .ok_or_else(|| HostkitError::Validation {
            message: format!(
                "no address given and host '{hostname}' has no entry under [network.hosts]"
            ),
        })
}

pub struct NetworkManager<'a, R: Runner> {
    runner: &'a R,
    settings: &'a NetworkSettings,
    on_path: fn(&str) -> bool,
}

impl<'a, R: Runner> NetworkManager<'a, R> {
    pub fn new(runner: &'a R, settings: &'a NetworkSettings) -> Self {
        Self {
            runner,
            settings,
            on_path: crate::runner::on_path,
        }
    }

    /// Replace the `PATH` lookup used for the tool check.
    pub fn path_probe(mut self, on_path: fn(&str) -> bool) -> Self {
        self.on_path = on_path;
        self
    }

    pub async fn hostname(&self) -> Result<String, HostkitError> {
        self.runner.output(&Cmd::new("uname").arg("-n")).await
    }

    pub async fn active_connection(&self) -> Result<NetworkConnection, HostkitError> {
        let listing = self
            .runner
            .output(&Cmd::new("nmcli").args([
                "-f",
                "TYPE,NAME,DEVICE",
                "-t",
                "connection",
                "show",
                "--active",
            ]))
            .await?;
        let (name, interface) =
            parse_active_ethernet(&listing).ok_or(HostkitError::NoActiveConnection)?;
        let current_ip = self.interface_ip(&interface).await?;
        Ok(NetworkConnection {
            name,
            interface,
            current_ip,
        })
    }

    async fn interface_ip(&self, interface: &str) -> Result<Option<IpAddr>, HostkitError> {
        let out = self
            .runner
            .output(&Cmd::new("ip").args(["-o", "-4", "addr", "show", "dev", interface]))
            .await?;
        Ok(parse_ipv4(&out))
    }

    /// Move the active wired profile to `requested` and confirm the device
    /// picked it up. A mismatch is reported, not rolled back.
    pub async fn reconfigure(&self, requested: &str) -> Result<NetworkConnection, HostkitError> {
        let ip: IpAddr = requested
            .trim()
            .parse()
            .map_err(|_| HostkitError::InvalidAddress {
                input: requested.to_string(),
            })?;
        require_tools(&["ip", "nmcli"], self.on_path)?;

        let conn = self.active_connection().await?;
        let policy = policy_for(&ip, &self.settings.subnets).ok_or_else(|| {
            HostkitError::UnsupportedSubnet {
                ip: ip.to_string(),
            }
        })?;

        tracing::info!(
            connection = %conn.name,
            interface = %conn.interface,
            previous = %conn.current_ip.map_or_else(|| "none".to_string(), |ip| ip.to_string()),
            requested = %ip,
            "reconfiguring static ip"
        );

        let modify = |key: &str, value: String| {
            Cmd::new("nmcli")
                .args(["connection", "modify"])
                .arg(&conn.name)
                .arg(key)
                .arg(value)
        };
        let steps = [
            modify("ipv4.addresses", format!("{ip}/{}", policy.prefix_len)),
            modify("ipv4.dns", policy.dns.join(" ")),
            modify("ipv4.gateway", policy.gateway.clone()),
            modify("ipv4.method", "manual".into()),
            Cmd::new("nmcli").args(["connection", "reload"]),
            Cmd::new("nmcli").args(["connection", "down"]).arg(&conn.name),
            Cmd::new("nmcli")
                .args(["connection", "up"])
                .arg(&conn.name)
                .arg("ifname")
                .arg(&conn.interface),
        ];
        for step in &steps {
            self.runner.output(step).await?;
        }

        let observed = self.interface_ip(&conn.interface).await?;
        if observed != Some(ip) {
            return Err(HostkitError::Verification {
                interface: conn.interface,
                requested: ip.to_string(),
                observed: observed.map(|o| o.to_string()),
            });
        }

        tracing::info!(interface = %conn.interface, ip = %ip, "static ip applied");
        Ok(NetworkConnection {
            current_ip: observed,
            ..conn
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_settings;
    use crate::runner::tests::FakeRunner;

    const ACTIVE: &str = "loopback:lo:lo\n802-3-ethernet:Wired connection 1:enp1s0\n";

    fn ip_line(addr: &str) -> String {
        format!(
            "2: enp1s0    inet {addr}/24 brd 192.168.4.255 scope global dynamic noprefixroute enp1s0\\       valid_lft 86000sec preferred_lft 86000sec"
        )
    }

    #[test]
    fn active_ethernet_skips_other_types() {
        assert_eq!(
            parse_active_ethernet(ACTIVE),
            Some(("Wired connection 1".into(), "enp1s0".into()))
        );
        assert_eq!(parse_active_ethernet("802-11-wireless:home:wlp2s0\n"), None);
        assert_eq!(parse_active_ethernet(""), None);
    }

    #[test]
    fn escaped_colons_stay_in_name() {
        assert_eq!(
            parse_active_ethernet("802-3-ethernet:lab\\:uplink:eno1"),
            Some(("lab:uplink".into(), "eno1".into()))
        );
    }

    #[test]
    fn first_ipv4_address_is_taken() {
        let out = format!("{}\n{}", ip_line("192.168.4.10"), ip_line("192.168.4.11"));
        assert_eq!(parse_ipv4(&out), Some("192.168.4.10".parse().unwrap()));
        assert_eq!(parse_ipv4(""), None);
    }

    #[test]
    fn policy_matches_whole_octets() {
        let subnets = test_settings(tempfile::tempdir().unwrap().path())
            .network
            .subnets;
        let hit = "192.168.4.234".parse().unwrap();
        assert_eq!(policy_for(&hit, &subnets).unwrap().gateway, "192.168.4.1");
        let near_miss = "192.168.40.2".parse().unwrap();
        assert!(policy_for(&near_miss, &subnets).is_none());
        let v6 = "fe80::1".parse().unwrap();
        assert!(policy_for(&v6, &subnets).is_none());
    }

    #[test]
    fn target_falls_back_to_host_table() {
        let hosts = BTreeMap::from([("aadp".to_string(), "192.168.4.234".to_string())]);
        assert_eq!(
            resolve_target(Some("192.168.4.5"), "aadp", &hosts).unwrap(),
            "192.168.4.5"
        );
        assert_eq!(resolve_target(None, "aadp", &hosts).unwrap(), "192.168.4.234");
        assert!(matches!(
            resolve_target(None, "laptop", &hosts),
            Err(HostkitError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_address_runs_nothing() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new();
        let err = manager(&runner, &settings.network)
            .reconfigure("192.168.4.300")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::InvalidAddress { .. }));
        assert!(runner.calls().is_empty());
    }

    fn manager<'a>(
        runner: &'a FakeRunner,
        settings: &'a NetworkSettings,
    ) -> NetworkManager<'a, FakeRunner> {
        NetworkManager::new(runner, settings).path_probe(|_| true)
    }

    #[tokio::test]
    async fn missing_nmcli_is_a_precondition() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new();
        let err = NetworkManager::new(&runner, &settings.network)
            .path_probe(|tool| tool != "nmcli")
            .reconfigure("192.168.4.10")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::Precondition { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn reconfigure_issues_nmcli_sequence_and_verifies() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new()
            .stdout("nmcli -f", ACTIVE)
            .stdout("ip -o -4 addr show dev enp1s0", &ip_line("192.168.4.10"));
        let conn = manager(&runner, &settings.network)
            .reconfigure("192.168.4.10")
            .await
            .unwrap();
        assert_eq!(conn.interface, "enp1s0");
        assert_eq!(conn.current_ip, Some("192.168.4.10".parse().unwrap()));
        assert_eq!(
            runner.rendered()[2..9],
            [
                "nmcli connection modify Wired connection 1 ipv4.addresses 192.168.4.10/24",
                "nmcli connection modify Wired connection 1 ipv4.dns 8.8.8.8 8.8.4.4 1.1.1.1 192.168.0.1",
                "nmcli connection modify Wired connection 1 ipv4.gateway 192.168.4.1",
                "nmcli connection modify Wired connection 1 ipv4.method manual",
                "nmcli connection reload",
                "nmcli connection down Wired connection 1",
                "nmcli connection up Wired connection 1 ifname enp1s0",
            ]
        );
    }

    #[tokio::test]
    async fn mismatch_after_up_is_a_verification_error() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new()
            .stdout("nmcli -f", ACTIVE)
            .stdout("ip -o -4", &ip_line("192.168.4.99"));
        let err = manager(&runner, &settings.network)
            .reconfigure("192.168.4.10")
            .await
            .unwrap_err();
        match err {
            HostkitError::Verification { observed, .. } => {
                assert_eq!(observed.as_deref(), Some("192.168.4.99"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmapped_subnet_changes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().stdout("nmcli -f", ACTIVE);
        let err = manager(&runner, &settings.network)
            .reconfigure("10.1.2.3")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::UnsupportedSubnet { .. }));
        assert!(!runner.rendered().iter().any(|c| c.contains("modify")));
    }

    #[tokio::test]
    async fn no_wired_profile_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let settings = test_settings(root.path());
        let runner = FakeRunner::new().stdout("nmcli -f", "802-11-wireless:home:wlp2s0");
        let err = manager(&runner, &settings.network)
            .reconfigure("192.168.4.10")
            .await
            .unwrap_err();
        assert!(matches!(err, HostkitError::NoActiveConnection));
    }
}
