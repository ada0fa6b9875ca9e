// vpnctl - Daemon Config Module
// Handles daemon configuration (listener, tunnel binary, probe strategy, etc.)

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use vpnctl_common::{is_loopback_address, DEFAULT_DAEMON_PORT};

/// Linux truncates a process's `comm` to this many bytes; `ps` and `pkill -x`
/// only ever see the truncated name
const MAX_PROCESS_NAME_LEN: usize = 15;

/// Get the runtime directory for daemon state
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join("vpnctl"))
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("vpnctl.sock"))
}

fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vpnctl")
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    UnixSocket,
    /// TCP with HTTP (loopback only)
    #[default]
    TcpHttp,
}

/// How the default route is inspected when no tunnel process is visible
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteInspectorKind {
    /// Pick by target OS
    #[default]
    Auto,
    /// `route -n get default` (macOS, BSD)
    Bsd,
    /// `ip route show default` (Linux)
    Iproute2,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind host for TCP mode
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for TCP mode
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Require the X-Vpnctl-Token header on every request
    #[serde(default)]
    pub require_auth: bool,

    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Enable group access to the Unix socket and runtime directory
    /// (0770/0660 instead of 0700/0600)
    #[serde(default)]
    pub group_access: bool,

    /// Directory holding the per-location .ovpn files
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,

    /// Tunnel binary name (looked up on PATH) or absolute path
    #[serde(default = "default_tunnel_binary")]
    pub tunnel_binary: String,

    /// Run the tunnel binary and the kill command through `sudo -n`
    #[serde(default = "default_use_sudo")]
    pub use_sudo: bool,

    /// Time the process must survive before it counts as started
    /// (used when ready_marker is empty)
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,

    /// Upper bound on the Starting state
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Output line that signals the tunnel is up; empty disables
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// How often the exit monitor polls the running process
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default)]
    pub route_inspector: RouteInspectorKind,

    /// Interface name prefixes that count as a tunnel
    #[serde(default = "default_tun_prefixes")]
    pub tun_prefixes: Vec<String>,

    /// Policy file appended by /add-sudoers
    #[serde(default = "default_sudoers_path")]
    pub sudoers_path: PathBuf,

    /// Upstream for /ip-info
    #[serde(default = "default_ip_info_url")]
    pub ip_info_url: String,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    DEFAULT_DAEMON_PORT
}

fn default_auth_token_path() -> PathBuf {
    config_root().join("daemon.token")
}

fn default_configs_dir() -> PathBuf {
    config_root().join("configs")
}

fn default_tunnel_binary() -> String {
    "openvpn".to_string()
}

fn default_use_sudo() -> bool {
    true
}

fn default_start_grace_ms() -> u64 {
    3000
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_ready_marker() -> String {
    "Initialization Sequence Completed".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    2000
}

fn default_tun_prefixes() -> Vec<String> {
    vec!["utun".to_string(), "tun".to_string(), "ppp".to_string()]
}

fn default_sudoers_path() -> PathBuf {
    PathBuf::from("/etc/sudoers")
}

fn default_ip_info_url() -> String {
    "https://ipinfo.io/json".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            require_auth: false,
            auth_token_path: default_auth_token_path(),
            group_access: false,
            configs_dir: default_configs_dir(),
            tunnel_binary: default_tunnel_binary(),
            use_sudo: default_use_sudo(),
            start_grace_ms: default_start_grace_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            ready_marker: default_ready_marker(),
            monitor_interval_ms: default_monitor_interval_ms(),
            route_inspector: RouteInspectorKind::default(),
            tun_prefixes: default_tun_prefixes(),
            sudoers_path: default_sudoers_path(),
            ip_info_url: default_ip_info_url(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Security violation: tcp-http may only bind to a loopback address (bind_host: {}).\n\
                 The control API starts and stops a privileged process and has no encryption.\n\
                 Use 127.0.0.1 / localhost, or switch listener_mode to 'unix-socket'.",
                self.bind_host
            );
        }

        if self.tunnel_binary.trim().is_empty() {
            anyhow::bail!("tunnel_binary must not be empty");
        }

        let process_name = self.tunnel_process_name();
        if process_name.len() > MAX_PROCESS_NAME_LEN {
            anyhow::bail!(
                "tunnel_binary file name '{}' is longer than {} bytes and could not be found in \
                 the process table; use a shorter name or a symlink",
                process_name,
                MAX_PROCESS_NAME_LEN
            );
        }

        if self.start_timeout() < self.start_grace() {
            anyhow::bail!(
                "start_timeout_secs ({}s) must not be shorter than start_grace_ms ({}ms)",
                self.start_timeout_secs,
                self.start_grace_ms
            );
        }

        if self.monitor_interval_ms == 0 {
            anyhow::bail!("monitor_interval_ms must be greater than zero");
        }

        Ok(())
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn ready_marker(&self) -> Option<&str> {
        let marker = self.ready_marker.trim();
        (!marker.is_empty()).then_some(marker)
    }

    /// Name the tunnel process shows up as in the process table
    pub fn tunnel_process_name(&self) -> String {
        std::path::Path::new(&self.tunnel_binary)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.tunnel_binary.clone())
    }

    /// configs_dir as an absolute path
    pub fn absolute_configs_dir(&self) -> Result<PathBuf> {
        if self.configs_dir.is_absolute() {
            return Ok(self.configs_dir.clone());
        }
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Ok(cwd.join(&self.configs_dir))
    }

    /// Load daemon configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = fs::read_to_string(&config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(&config_path, contents)
            .context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("vpnctl").join("daemon.toml"))
    }
}

/// Write CLI config snippet to help users configure their CLI
pub fn write_cli_config_snippet(config: &DaemonConfig, auth_token: Option<&str>) -> Result<()> {
    let snippet_path = config_root().join("cli-config.snippet");

    if let Some(parent) = snippet_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let mut content = String::from(
        "# CLI configuration for vpnctl\n\
         # Copy this to ~/.config/vpnctl/cli.toml\n\n",
    );
    match config.listener_mode {
        ListenerMode::UnixSocket => {
            let socket = socket_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "auto-detect".to_string());
            content.push_str("connection_mode = \"unix-socket\"\n");
            content.push_str(&format!("daemon_url = \"{}\"\n", socket));
        }
        ListenerMode::TcpHttp => {
            content.push_str("connection_mode = \"http\"\n");
            content.push_str(&format!("daemon_host = \"{}\"\n", config.bind_host));
            content.push_str(&format!("daemon_port = {}\n", config.bind_port));
        }
    }
    if let Some(token) = auth_token {
        content.push_str(&format!("auth_token = \"{}\"\n", token));
    }

    fs::write(&snippet_path, content).context("Failed to write CLI config snippet")?;

    info!("CLI configuration snippet written to {}", snippet_path.display());
    info!("To configure the CLI, run: cp {} ~/.config/vpnctl/cli.toml", snippet_path.display());

    Ok(())
}
