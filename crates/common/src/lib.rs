// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Common Library
// Shared types, error taxonomy and daemon client helpers

pub mod daemon_client;
pub mod error;
pub mod network;
pub mod sse;
pub mod types;

pub use daemon_client::{
    add_auth_header, add_sudoers, create_daemon_client, fetch_ip_info, fetch_locations,
    fetch_status, start_vpn, stop_vpn, ConnectionMode, DaemonClientConfig, AUTH_TOKEN_HEADER,
    DEFAULT_DAEMON_PORT,
};
pub use error::{Error, ErrorKind, Result};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use types::{
    ConnectionEvent, ConnectionState, ErrorResponse, Evidence, Location, LocationInfo,
    LocationsResponse, MessageResponse, ProbeResult, StatusReport,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
