// Error types for vpnctl

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Location key is not one of the known profiles
    #[error("Invalid location")]
    UnknownLocation(String),

    #[error("Configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Could not find {0} in system PATH")]
    BinaryNotFound(String),

    #[error("A VPN connection is already running or starting")]
    AlreadyRunningOrStarting,

    #[error("Another start or stop request is in progress")]
    TransitionInProgress,

    #[error("VPN process exited with code {}", exit_code_label(.0))]
    ProcessLaunchFailed(Option<i32>),

    #[error("Failed to launch VPN process: {0}")]
    SpawnFailed(String),

    #[error("VPN process did not become ready within {}s", .0.as_secs())]
    StartTimeout(Duration),

    #[error("Error stopping VPN: {0}")]
    TerminationFailed(String),

    #[error("Error checking VPN status: {0}")]
    ProbeUnavailable(String),

    #[error("Error updating sudoers file: {0}")]
    PolicyUpdate(String),

    #[error("IPInfo API error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

/// Stable, machine-readable error category carried in API error bodies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownLocation,
    ConfigNotFound,
    BinaryNotFound,
    AlreadyRunningOrStarting,
    TransitionInProgress,
    ProcessLaunchFailed,
    SpawnFailed,
    StartTimeout,
    TerminationFailed,
    ProbeUnavailable,
    PolicyUpdate,
    Upstream,
    Config,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownLocation(_) => ErrorKind::UnknownLocation,
            Error::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            Error::BinaryNotFound(_) => ErrorKind::BinaryNotFound,
            Error::AlreadyRunningOrStarting => ErrorKind::AlreadyRunningOrStarting,
            Error::TransitionInProgress => ErrorKind::TransitionInProgress,
            Error::ProcessLaunchFailed(_) => ErrorKind::ProcessLaunchFailed,
            Error::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Error::StartTimeout(_) => ErrorKind::StartTimeout,
            Error::TerminationFailed(_) => ErrorKind::TerminationFailed,
            Error::ProbeUnavailable(_) => ErrorKind::ProbeUnavailable,
            Error::PolicyUpdate(_) => ErrorKind::PolicyUpdate,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_location_message_is_stable() {
        let err = Error::UnknownLocation("narnia".to_string());
        assert_eq!(err.to_string(), "Invalid location");
        assert_eq!(err.kind(), ErrorKind::UnknownLocation);
    }

    #[test]
    fn test_launch_failure_carries_exit_code() {
        assert_eq!(
            Error::ProcessLaunchFailed(Some(1)).to_string(),
            "VPN process exited with code 1"
        );
        assert!(Error::ProcessLaunchFailed(None)
            .to_string()
            .contains("terminated by signal"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AlreadyRunningOrStarting).unwrap();
        assert_eq!(json, "\"already_running_or_starting\"");
    }
}
