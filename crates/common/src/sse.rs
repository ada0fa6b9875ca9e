// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

//! Server-Sent Events listener for real-time connection updates

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::{add_auth_header, ConnectionEvent, DaemonClientConfig};

/// Event listener for the daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events.
    /// Reconnects with exponential backoff if the stream drops.
    pub async fn listen(&self) -> Result<mpsc::Receiver<ConnectionEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                if let Err(e) = Self::stream_events(&config, tx.clone()).await {
                    tracing::warn!("Event stream error: {}", e);
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }

    async fn stream_events(
        config: &DaemonClientConfig,
        tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<()> {
        let url = format!("{}/events", config.daemon_base_url()?);
        let client = crate::create_daemon_client(config)?;
        let request = add_auth_header(client.get(&url), config);

        let response = request
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    break;
                }
            };

            let Ok(text) = std::str::from_utf8(&bytes) else {
                continue;
            };
            buffer.push_str(text);

            while let Some(pos) = buffer.find("\n\n") {
                let message = buffer[..pos].to_string();
                buffer.drain(..pos + 2);

                if let Some(event) = parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parse one SSE message ("data: {json}" lines) into an event
pub fn parse_sse_message(message: &str) -> Option<ConnectionEvent> {
    for line in message.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        match serde_json::from_str::<ConnectionEvent>(data.trim_start()) {
            Ok(event) => return Some(event),
            Err(e) => tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e),
        }
    }
    None
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;

    #[test]
    fn test_parse_sse_message() {
        let event = parse_sse_message("data: {\"type\":\"starting\",\"location\":\"uk\"}").unwrap();
        assert_eq!(event, ConnectionEvent::Starting { location: Location::Uk });

        let event = parse_sse_message("event: x\ndata:{\"type\":\"stopped\"}").unwrap();
        assert_eq!(event, ConnectionEvent::Stopped);
    }

    #[test]
    fn test_parse_sse_message_ignores_garbage() {
        assert!(parse_sse_message(": keep-alive").is_none());
        assert!(parse_sse_message("data: not json").is_none());
    }
}
