// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Daemon Client Module
// Shared daemon connection logic for the CLI and other frontends

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorResponse, LocationsResponse, MessageResponse, StatusReport};

/// HTTP header carrying the daemon authentication token
pub const AUTH_TOKEN_HEADER: &str = "X-Vpnctl-Token";

/// Default TCP port of the daemon API
pub const DEFAULT_DAEMON_PORT: u16 = 3006;

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    UnixSocket,
    /// Plain HTTP on a loopback address
    #[default]
    Http,
}

/// Client configuration for connecting to daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode (optional)
    #[serde(default)]
    pub daemon_url: String,

    /// Authentication token (if daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    DEFAULT_DAEMON_PORT
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            daemon_url: String::new(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Get the daemon base URL based on connection mode
    pub fn daemon_base_url(&self) -> Result<String> {
        match self.connection_mode {
            // reqwest needs some authority even when talking over a socket
            ConnectionMode::UnixSocket => Ok("http://daemon".to_string()),
            ConnectionMode::Http => {
                if self.daemon_host.is_empty() {
                    anyhow::bail!("daemon_host is required for HTTP mode but is empty");
                }
                let host_port = crate::format_host_port(&self.daemon_host, self.daemon_port);
                Ok(format!("http://{}", host_port))
            }
        }
    }

    /// Get the Unix socket path (for UnixSocket mode)
    ///
    /// Checks, in order: explicit path in daemon_url, the user runtime
    /// directory, then the system-wide location.
    pub fn socket_path(&self) -> Result<PathBuf> {
        let candidate = self.daemon_url.trim();
        if !candidate.is_empty()
            && (candidate.starts_with('/') || candidate.starts_with("./") || candidate.starts_with("../"))
        {
            return Ok(PathBuf::from(candidate));
        }

        if let Some(runtime_dir) = dirs::runtime_dir() {
            let user_socket = runtime_dir.join("vpnctl").join("vpnctl.sock");
            if user_socket.exists() {
                return Ok(user_socket);
            }
        }

        let system_socket = PathBuf::from("/run/vpnctl/vpnctl.sock");
        if system_socket.exists() {
            return Ok(system_socket);
        }

        dirs::runtime_dir()
            .map(|runtime_dir| runtime_dir.join("vpnctl").join("vpnctl.sock"))
            .ok_or_else(|| {
                anyhow::anyhow!("Could not determine runtime directory and no system socket found")
            })
    }
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    // Starting can take as long as the daemon's start timeout
    let mut client_builder = Client::builder().timeout(Duration::from_secs(120));

    if config.connection_mode == ConnectionMode::UnixSocket {
        #[cfg(unix)]
        {
            let socket_path = config.socket_path()?;
            client_builder = client_builder.unix_socket(socket_path);
        }
        #[cfg(not(unix))]
        anyhow::bail!("Unix socket mode is not supported on this platform");
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to request if configured
pub fn add_auth_header(
    request: reqwest::RequestBuilder,
    config: &DaemonClientConfig,
) -> reqwest::RequestBuilder {
    if config.auth_token.is_empty() {
        request
    } else {
        request.header(AUTH_TOKEN_HEADER, &config.auth_token)
    }
}

/// Turn a non-success daemon response into an error carrying its message
async fn error_from_response(resp: Response) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => anyhow::anyhow!("{} ({})", err.error, status),
        Err(_) if !body.is_empty() => anyhow::anyhow!("{} ({})", body, status),
        Err(_) => anyhow::anyhow!("Daemon returned {}", status),
    }
}

async fn send(request: reqwest::RequestBuilder, what: &str) -> Result<Response> {
    let resp = request
        .send()
        .await
        .with_context(|| format!("Failed to send {} request to daemon", what))?;

    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(error_from_response(resp).await)
    }
}

/// Ask the daemon to connect to a location
pub async fn start_vpn(client: &Client, config: &DaemonClientConfig, location: &str) -> Result<String> {
    let url = format!("{}/start/{}", config.daemon_base_url()?, location);
    let resp = send(add_auth_header(client.post(&url), config), "start").await?;
    let body: MessageResponse = resp.json().await.context("Failed to parse start response")?;
    Ok(body.message)
}

/// Ask the daemon to tear the tunnel down
pub async fn stop_vpn(client: &Client, config: &DaemonClientConfig) -> Result<String> {
    let url = format!("{}/stop", config.daemon_base_url()?);
    let resp = send(add_auth_header(client.post(&url), config), "stop").await?;
    let body: MessageResponse = resp.json().await.context("Failed to parse stop response")?;
    Ok(body.message)
}

pub async fn fetch_status(client: &Client, config: &DaemonClientConfig) -> Result<StatusReport> {
    let url = format!("{}/status/detail", config.daemon_base_url()?);
    let resp = send(add_auth_header(client.get(&url), config), "status").await?;
    resp.json().await.context("Failed to parse status response")
}

pub async fn fetch_locations(client: &Client, config: &DaemonClientConfig) -> Result<LocationsResponse> {
    let url = format!("{}/locations", config.daemon_base_url()?);
    let resp = send(add_auth_header(client.get(&url), config), "locations").await?;
    resp.json().await.context("Failed to parse locations response")
}

/// Trigger the one-time sudoers bootstrap on the daemon host
pub async fn add_sudoers(client: &Client, config: &DaemonClientConfig) -> Result<String> {
    let url = format!("{}/add-sudoers", config.daemon_base_url()?);
    let resp = send(add_auth_header(client.get(&url), config), "add-sudoers").await?;
    resp.text().await.context("Failed to read add-sudoers response")
}

/// Public IP information as seen through the tunnel
pub async fn fetch_ip_info(client: &Client, config: &DaemonClientConfig) -> Result<serde_json::Value> {
    let url = format!("{}/ip-info", config.daemon_base_url()?);
    let resp = send(add_auth_header(client.get(&url), config), "ip-info").await?;
    resp.json().await.context("Failed to parse ip-info response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonClientConfig::default();
        assert_eq!(config.connection_mode, ConnectionMode::Http);
        assert_eq!(config.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon_port, 3006);
    }

    #[test]
    fn test_daemon_base_url() {
        let mut config = DaemonClientConfig::default();
        assert_eq!(config.daemon_base_url().unwrap(), "http://127.0.0.1:3006");

        config.connection_mode = ConnectionMode::UnixSocket;
        assert_eq!(config.daemon_base_url().unwrap(), "http://daemon");

        config.connection_mode = ConnectionMode::Http;
        config.daemon_host = String::new();
        assert!(config.daemon_base_url().is_err());
    }

    #[test]
    fn test_explicit_socket_path_wins() {
        let config = DaemonClientConfig {
            connection_mode: ConnectionMode::UnixSocket,
            daemon_url: "/tmp/custom.sock".to_string(),
            ..Default::default()
        };
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn test_config_parses_from_toml() {
        let config: DaemonClientConfig = toml::from_str(
            r#"
            connection_mode = "unix-socket"
            auth_token = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection_mode, ConnectionMode::UnixSocket);
        assert_eq!(config.auth_token, "secret");
        assert_eq!(config.daemon_port, 3006);
    }
}
