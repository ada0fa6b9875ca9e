// Common types for vpnctl

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Locations the daemon has a tunnel profile for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    France,
    Usa,
    Uk,
    Australia,
    Uae,
}

impl Location {
    pub const ALL: [Location; 5] = [
        Location::France,
        Location::Usa,
        Location::Uk,
        Location::Australia,
        Location::Uae,
    ];

    /// Key used in URLs and on the command line
    pub fn key(&self) -> &'static str {
        match self {
            Location::France => "france",
            Location::Usa => "usa",
            Location::Uk => "uk",
            Location::Australia => "australia",
            Location::Uae => "uae",
        }
    }

    /// File name of the tunnel configuration for this location
    pub fn config_file(&self) -> &'static str {
        match self {
            Location::France => "franceclient.ovpn",
            Location::Usa => "usanewclient.ovpn",
            Location::Uk => "uknewclient.ovpn",
            Location::Australia => "australiaclient.ovpn",
            Location::Uae => "uaenewclient.ovpn",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Location {
    type Err = Error;

    /// Exact match only: no trimming, no case folding
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::ALL
            .iter()
            .copied()
            .find(|location| location.key() == s)
            .ok_or_else(|| Error::UnknownLocation(s.to_string()))
    }
}

/// Believed state of the single connection slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Failed(String),
}

impl ConnectionState {
    /// A start request is allowed from this state
    pub fn accepts_start(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed(_))
    }

    /// A transition is currently running
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ConnectionState::Starting | ConnectionState::Stopping)
    }
}

/// What the probe saw that made it decide a tunnel is up
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    ProcessTableMatch,
    RouteTableMatch,
    None,
}

/// Ground-truth tunnel activity, recomputed on every query
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub is_active: bool,
    pub evidence: Evidence,
}

impl ProbeResult {
    pub fn active(evidence: Evidence) -> Self {
        Self {
            is_active: true,
            evidence,
        }
    }

    pub fn inactive() -> Self {
        Self {
            is_active: false,
            evidence: Evidence::None,
        }
    }
}

/// Response of the detailed status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Derived from the probe only
    pub active: bool,
    pub evidence: Evidence,
    /// Daemon's in-memory belief, for diagnostics
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl StatusReport {
    pub fn message(&self) -> &'static str {
        if self.active {
            "VPN is active"
        } else {
            "No VPN is active"
        }
    }
}

/// Events emitted by the daemon when the connection slot changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Starting { location: Location },
    Connected { location: Location, pid: Option<u32> },
    Stopping,
    Stopped,
    /// Tunnel process went away on its own
    Disconnected { reason: String },
    Failed { error: String },
    Heartbeat { timestamp: DateTime<Utc> },
}

/// One entry of the location listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationInfo {
    pub location: Location,
    pub config_path: PathBuf,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationsResponse {
    pub locations: Vec<LocationInfo>,
}

/// API success response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}
