// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Authentication Module
// Optional shared-token check in front of the control API

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use vpnctl_common::AUTH_TOKEN_HEADER;

/// Obfuscate a token for logging (show only last 4 characters)
/// Example: "abc123def456" -> "********f456"
pub fn obfuscate_token(token: &str) -> String {
    if token.len() < 4 {
        // If token is very short, just mask everything
        "*".repeat(token.len())
    } else {
        let visible_chars = 4;
        let mask_len = token.len() - visible_chars;
        format!("{}{}", "*".repeat(mask_len), &token[mask_len..])
    }
}

/// Generate a new authentication token
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Load or generate authentication token from file
/// Returns (token, was_newly_generated)
pub fn load_or_generate_token(token_path: &Path) -> Result<(String, bool)> {
    // If token file exists, load it
    if token_path.exists() {
        let token = fs::read_to_string(token_path)
            .context("Failed to read authentication token file")?
            .trim()
            .to_string();

        if token.is_empty() {
            warn!("Token file exists but is empty, regenerating");
        } else {
            info!("Loaded authentication token from: {}", token_path.display());
            return Ok((token, false));
        }
    }

    // Generate new token
    let token = generate_token();
    save_token(token_path, &token)?;

    info!("Generated new authentication token");
    info!("Token saved to: {}", token_path.display());
    info!(
        "Clients must send {} with token {} (full token in {})",
        AUTH_TOKEN_HEADER,
        obfuscate_token(&token),
        token_path.display()
    );

    Ok((token, true))
}

/// Save authentication token to file
fn save_token(token_path: &Path, token: &str) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = token_path.parent() {
        fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    // Write token to file
    fs::write(token_path, token).context("Failed to write token file")?;

    // Set restrictive permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(token_path, permissions)
            .context("Failed to set token file permissions")?;
    }

    Ok(())
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    token: Zeroizing<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Zeroizing::new(token),
        }
    }
}

/// Rejects requests without the configured token with 401.
/// `/health` stays open so supervisors can probe liveness.
pub async fn auth_middleware(
    axum::extract::State(auth_state): axum::extract::State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let provided_token = request
        .headers()
        .get(AUTH_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    // Validate token
    match provided_token {
        Some(token) if token == auth_state.token.as_str() => {
            // Status polling makes this noisy
            tracing::trace!("Authentication successful");
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Authentication failed: invalid token");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Authentication failed: missing token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn guarded_router() -> Router {
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/vpn-status", get(|| async { "No VPN is active" }))
            .layer(axum::middleware::from_fn_with_state(
                AuthState::new("s3cret-token".to_string()),
                auth_middleware,
            ))
    }

    #[test]
    fn test_obfuscate_token() {
        // Normal token (UUID format is 36 chars)
        let token = "abc123de-f456-7890-1234-567890abcdef";
        let obfuscated = obfuscate_token(token);
        assert_eq!(obfuscated, "********************************cdef");
        assert_eq!(obfuscated.len(), token.len());

        // Short token (4 chars)
        let short = "1234";
        assert_eq!(obfuscate_token(short), "1234");

        // Very short token (less than 4 chars)
        let very_short = "abc";
        assert_eq!(obfuscate_token(very_short), "***");

        // Longer custom token
        let custom = "my-secret-token-12345";
        let obfuscated_custom = obfuscate_token(custom);
        assert_eq!(obfuscated_custom, "*****************2345");
        assert!(obfuscated_custom.ends_with("2345"));
    }

    #[test]
    fn test_generate_token() {
        let token = generate_token();
        assert!(!token.is_empty());
        // Should be a valid UUID
        assert!(Uuid::parse_str(&token).is_ok());
    }

    #[test]
    fn test_save_and_load_token() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("test.token");

        // Generate and save token
        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(!token.is_empty());
        assert!(was_new);

        // Load token again
        let (loaded_token, was_new2) = load_or_generate_token(&token_path).unwrap();
        assert_eq!(token, loaded_token);
        assert!(!was_new2);
    }

    #[test]
    fn test_empty_token_file_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        fs::write(&token_path, "  \n").unwrap();

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(was_new);
        assert_eq!(fs::read_to_string(&token_path).unwrap(), token);
    }

    #[tokio::test]
    async fn test_middleware_requires_token() {
        let missing = guarded_router()
            .oneshot(axum::http::Request::builder().uri("/vpn-status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = guarded_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/vpn-status")
                    .header(AUTH_TOKEN_HEADER, "guess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = guarded_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/vpn-status")
                    .header(AUTH_TOKEN_HEADER, "s3cret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let response = guarded_router()
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_token_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("test.token");

        let (_token, _was_new) = load_or_generate_token(&token_path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&token_path).unwrap();
            let permissions = metadata.permissions();
            assert_eq!(permissions.mode() & 0o777, 0o600);
        }
    }
}
