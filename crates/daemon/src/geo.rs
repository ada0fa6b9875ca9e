// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - IP geolocation passthrough
// Fetches the public IP description so clients can see where traffic exits

use std::time::Duration;

use tracing::debug;

use vpnctl_common::{Error, Result};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct GeoClient {
    client: reqwest::Client,
    url: String,
}

impl GeoClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| Error::Upstream(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Upstream JSON, returned unmodified
    pub async fn lookup(&self) -> Result<serde_json::Value> {
        debug!("Fetching IP info from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Failed to fetch IP info: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(status.to_string()));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Invalid IP info response: {}", e)))
    }
}
