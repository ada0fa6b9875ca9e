// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Profile Registry
// Maps location keys to the .ovpn file used for that location

use std::path::{Path, PathBuf};

use vpnctl_common::{Error, Location, LocationInfo, Result};

/// Tunnel profile for one location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub location: Location,
    pub config_path: PathBuf,
}

/// Fixed table of profiles, built once at startup
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<ConnectionProfile>,
}

impl ProfileRegistry {
    /// Build the registry rooted at an absolute configs directory
    pub fn new(configs_dir: &Path) -> Self {
        let profiles = Location::ALL
            .iter()
            .map(|location| ConnectionProfile {
                location: *location,
                config_path: configs_dir.join(location.config_file()),
            })
            .collect();
        Self { profiles }
    }

    /// Look up a profile by its exact key. Fails closed.
    pub fn resolve(&self, key: &str) -> Result<&ConnectionProfile> {
        let location: Location = key.parse()?;
        self.profiles
            .iter()
            .find(|profile| profile.location == location)
            .ok_or_else(|| Error::UnknownLocation(key.to_string()))
    }

    /// Whether the configuration artifact is present on disk
    pub fn validate(path: &Path) -> bool {
        path.is_file()
    }

    pub fn profiles(&self) -> Vec<LocationInfo> {
        self.profiles
            .iter()
            .map(|profile| LocationInfo {
                location: profile.location,
                config_path: profile.config_path.clone(),
                available: Self::validate(&profile.config_path),
            })
            .collect()
    }
}
