// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Process Probe
// Ground-truth tunnel detection from the process table and the routing table

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use vpnctl_common::{Error, Evidence, ProbeResult, Result};

use crate::config::{DaemonConfig, RouteInspectorKind};

/// Source of truth about whether a tunnel is up, independent of what the
/// supervisor believes
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn detect(&self) -> Result<ProbeResult>;
}

/// Lists the processes on the host
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// One `<state> <command>` row per process
    async fn commands(&self) -> Result<String>;
}

/// `ps -A -o stat= -o comm=`
pub struct PsProcessTable;

#[async_trait]
impl ProcessTable for PsProcessTable {
    async fn commands(&self) -> Result<String> {
        run_probe_command("ps", &["-A", "-o", "stat=", "-o", "comm="]).await
    }
}

/// Platform strategy for reading the default route's outbound interface
#[async_trait]
pub trait RouteInspector: Send + Sync {
    /// `None` when the host has no default route
    async fn default_interface(&self) -> Result<Option<String>>;
}

/// `route -n get default`
pub struct BsdRouteInspector;

#[async_trait]
impl RouteInspector for BsdRouteInspector {
    async fn default_interface(&self) -> Result<Option<String>> {
        let output = Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .await
            .map_err(|e| Error::ProbeUnavailable(format!("Failed to execute route command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not in table") {
                return Ok(None);
            }
            return Err(Error::ProbeUnavailable(format!(
                "Failed to execute route command: {}",
                stderr.trim()
            )));
        }

        Ok(parse_bsd_interface(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `ip route show default`
pub struct Iproute2RouteInspector;

#[async_trait]
impl RouteInspector for Iproute2RouteInspector {
    async fn default_interface(&self) -> Result<Option<String>> {
        let stdout = run_probe_command("ip", &["route", "show", "default"]).await?;
        Ok(parse_iproute2_interface(&stdout))
    }
}

/// Route inspector for the configured strategy
pub fn route_inspector(kind: RouteInspectorKind) -> Box<dyn RouteInspector> {
    match kind {
        RouteInspectorKind::Bsd => Box::new(BsdRouteInspector),
        RouteInspectorKind::Iproute2 => Box::new(Iproute2RouteInspector),
        RouteInspectorKind::Auto => {
            if cfg!(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            )) {
                Box::new(BsdRouteInspector)
            } else {
                Box::new(Iproute2RouteInspector)
            }
        }
    }
}

/// Two-stage probe: process table first, default route as fallback
pub struct SystemProbe {
    process_name: String,
    tun_prefixes: Vec<String>,
    processes: Box<dyn ProcessTable>,
    routes: Box<dyn RouteInspector>,
}

impl SystemProbe {
    pub fn new(
        process_name: impl Into<String>,
        tun_prefixes: Vec<String>,
        processes: Box<dyn ProcessTable>,
        routes: Box<dyn RouteInspector>,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            tun_prefixes,
            processes,
            routes,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(
            config.tunnel_process_name(),
            config.tun_prefixes.clone(),
            Box::new(PsProcessTable),
            route_inspector(config.route_inspector),
        )
    }
}

#[async_trait]
impl ProcessProbe for SystemProbe {
    async fn detect(&self) -> Result<ProbeResult> {
        let table = self.processes.commands().await?;
        if process_table_contains(&table, &self.process_name) {
            trace!("Probe: {} found in process table", self.process_name);
            return Ok(ProbeResult::active(Evidence::ProcessTableMatch));
        }

        match self.routes.default_interface().await? {
            Some(iface) if is_tunnel_interface(&iface, &self.tun_prefixes) => {
                debug!("Probe: default route goes through tunnel interface {}", iface);
                Ok(ProbeResult::active(Evidence::RouteTableMatch))
            }
            Some(iface) => {
                trace!("Probe: default route via {}", iface);
                Ok(ProbeResult::inactive())
            }
            None => Ok(ProbeResult::inactive()),
        }
    }
}

/// Run a probe command, mapping any failure to ProbeUnavailable
async fn run_probe_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::ProbeUnavailable(format!("Failed to execute {} command: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::ProbeUnavailable(format!(
            "Failed to execute {} command ({}): {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Match `ps -o stat= -o comm=` rows by command name. Zombies (state `Z`) have
/// already exited and do not count. macOS prints full paths, which may
/// contain spaces.
pub fn process_table_contains(table: &str, process_name: &str) -> bool {
    table.lines().filter_map(parse_process_row).any(|(stat, command)| {
        !stat.starts_with('Z')
            && Path::new(command)
                .file_name()
                .is_some_and(|name| name == process_name)
    })
}

fn parse_process_row(row: &str) -> Option<(&str, &str)> {
    let (stat, command) = row.trim().split_once(char::is_whitespace)?;
    let command = command.trim();
    (!command.is_empty()).then_some((stat, command))
}

/// Pull the value of the `interface:` line out of `route -n get default`
pub fn parse_bsd_interface(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("interface:"))
        .map(|iface| iface.trim().to_string())
        .find(|iface| !iface.is_empty())
}

/// Pull the device out of `ip route show default` ("default via X dev tun0 ...")
pub fn parse_iproute2_interface(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|token| *token == "dev")?;
        tokens.next().map(str::to_string)
    })
}

pub fn is_tunnel_interface(iface: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && iface.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const BSD_ROUTE_UTUN: &str = "   route to: default\n\
destination: default\n\
       mask: default\n\
    gateway: 10.8.0.1\n\
  interface: utun4\n\
      flags: <UP,GATEWAY,DONE,STATIC,PRCLONING>\n";

    const BSD_ROUTE_EN0: &str = "   route to: default\n\
destination: default\n\
    gateway: 192.168.1.1\n\
  interface: en0\n";

    fn prefixes() -> Vec<String> {
        vec!["utun".into(), "tun".into(), "ppp".into()]
    }

    #[test]
    fn test_process_table_contains() {
        let table = "Ss   systemd\nSs   sshd\nS+   sudo\nS    openvpn\nSs   bash\n";
        assert!(process_table_contains(table, "openvpn"));
        assert!(!process_table_contains("Ss systemd\nSs sshd\n", "openvpn"));
        // macOS prints absolute paths
        assert!(process_table_contains(
            "Ss   /sbin/launchd\nS    /usr/local/sbin/openvpn\n",
            "openvpn"
        ));
        assert!(process_table_contains(
            "S /Applications/Tunnel Tools.app/Contents/MacOS/openvpn\n",
            "openvpn"
        ));
        // Only whole names count
        assert!(!process_table_contains("S openvpn-helper\nS myopenvpn\n", "openvpn"));
        // A row without a command is skipped
        assert!(!process_table_contains("S\n\n", "openvpn"));
    }

    #[test]
    fn test_zombie_rows_do_not_count() {
        assert!(!process_table_contains("Ss init\nZ    openvpn\n", "openvpn"));
        assert!(!process_table_contains("Z+ openvpn\n", "openvpn"));
        assert!(process_table_contains("Z openvpn\nS openvpn\n", "openvpn"));
    }

    #[test]
    fn test_parse_bsd_interface() {
        assert_eq!(parse_bsd_interface(BSD_ROUTE_UTUN).as_deref(), Some("utun4"));
        assert_eq!(parse_bsd_interface(BSD_ROUTE_EN0).as_deref(), Some("en0"));
        assert_eq!(parse_bsd_interface("route to: default\n"), None);
    }

    #[test]
    fn test_parse_iproute2_interface() {
        assert_eq!(
            parse_iproute2_interface("default via 10.8.0.1 dev tun0 proto static\n").as_deref(),
            Some("tun0")
        );
        assert_eq!(
            parse_iproute2_interface("default via 192.168.1.1 dev wlan0 proto dhcp metric 600\n")
                .as_deref(),
            Some("wlan0")
        );
        assert_eq!(parse_iproute2_interface(""), None);
    }

    #[test]
    fn test_is_tunnel_interface() {
        for iface in ["utun0", "utun12", "tun0", "ppp0"] {
            assert!(is_tunnel_interface(iface, &prefixes()), "{}", iface);
        }
        for iface in ["en0", "eth0", "wlan0", "lo"] {
            assert!(!is_tunnel_interface(iface, &prefixes()), "{}", iface);
        }
        assert!(!is_tunnel_interface("eth0", &[String::new()]));
    }

    struct FixedTable(&'static str);

    #[async_trait]
    impl ProcessTable for FixedTable {
        async fn commands(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct BrokenTable;

    #[async_trait]
    impl ProcessTable for BrokenTable {
        async fn commands(&self) -> Result<String> {
            Err(Error::ProbeUnavailable("ps: permission denied".into()))
        }
    }

    struct FixedRoute {
        iface: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RouteInspector for FixedRoute {
        async fn default_interface(&self) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.iface.map(str::to_string))
        }
    }

    struct BrokenRoute;

    #[async_trait]
    impl RouteInspector for BrokenRoute {
        async fn default_interface(&self) -> Result<Option<String>> {
            Err(Error::ProbeUnavailable("route: command not found".into()))
        }
    }

    fn probe(table: impl ProcessTable + 'static, routes: impl RouteInspector + 'static) -> SystemProbe {
        SystemProbe::new("openvpn", prefixes(), Box::new(table), Box::new(routes))
    }

    #[tokio::test]
    async fn test_process_match_short_circuits_route_check() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = probe(
            FixedTable("Ss init\nS openvpn\n"),
            FixedRoute { iface: Some("eth0"), calls: calls.clone() },
        );
        let result = probe.detect().await.unwrap();
        assert_eq!(result, ProbeResult::active(Evidence::ProcessTableMatch));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_route_stage_reports_tunnel_interface() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = probe(
            FixedTable("Ss init\nSs sshd\n"),
            FixedRoute { iface: Some("utun3"), calls: calls.clone() },
        );
        let result = probe.detect().await.unwrap();
        assert_eq!(result, ProbeResult::active(Evidence::RouteTableMatch));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_stage_reports_inactive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let on_ethernet = probe(
            FixedTable("Ss init\n"),
            FixedRoute { iface: Some("eth0"), calls: calls.clone() },
        );
        assert_eq!(on_ethernet.detect().await.unwrap(), ProbeResult::inactive());

        let no_route = probe(FixedTable("Ss init\n"), FixedRoute { iface: None, calls });
        assert_eq!(no_route.detect().await.unwrap(), ProbeResult::inactive());
    }

    #[tokio::test]
    async fn test_probe_failures_are_not_coerced_to_inactive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = probe(BrokenTable, FixedRoute { iface: None, calls })
            .detect()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeUnavailable(_)));

        let err = probe(FixedTable("Ss init\n"), BrokenRoute).detect().await.unwrap_err();
        assert!(matches!(err, Error::ProbeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_command_is_probe_unavailable() {
        let err = run_probe_command("vpnctl-definitely-not-a-command", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeUnavailable(_)));
    }
}
