// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Daemon
// Local control service that starts, stops and reports on the VPN tunnel

mod api;
mod auth;
mod config;
mod geo;
mod permissions;
mod pidfile;
mod probe;
mod registry;
mod runner;
mod sudoers;
mod supervisor;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState, BootstrapSettings};
use config::{DaemonConfig, ListenerMode};
use geo::GeoClient;
use probe::SystemProbe;
use registry::ProfileRegistry;
use runner::CommandRunner;
use supervisor::{ConnectionSupervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Before any file is created
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpnctl_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("vpnctl daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Authentication required: {}", daemon_config.require_auth);

    let (auth_token, token_was_generated) = if daemon_config.require_auth {
        let (token, was_new) = auth::load_or_generate_token(&daemon_config.auth_token_path)?;
        (Some(token), was_new)
    } else {
        info!("Authentication disabled - API endpoints are accessible to any local client");
        (None, false)
    };

    if token_was_generated {
        config::write_cli_config_snippet(&daemon_config, auth_token.as_deref())?;
    }

    // Missing binary is not fatal: start and add-sudoers report it per request
    let binary = runner::resolve_binary(&daemon_config.tunnel_binary);
    match &binary {
        Some(path) => info!("Tunnel binary: {}", path.display()),
        None => warn!(
            "Could not find {} in system PATH; starts will fail until it is installed",
            daemon_config.tunnel_binary
        ),
    }

    let configs_dir = daemon_config.absolute_configs_dir()?;
    info!("Tunnel configurations: {}", configs_dir.display());
    let registry = ProfileRegistry::new(&configs_dir);
    for profile in registry.profiles().iter().filter(|p| !p.available) {
        debug!(
            "No configuration for {} at {}",
            profile.location,
            profile.config_path.display()
        );
    }

    let supervisor = ConnectionSupervisor::new(
        registry,
        Arc::new(SystemProbe::from_config(&daemon_config)),
        Arc::new(CommandRunner::new(daemon_config.use_sudo)),
        SupervisorSettings::from_config(&daemon_config, binary.clone()),
    );
    let _monitor = supervisor.spawn_monitor();

    let mut event_rx = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Connection event: {:?}", event);
        }
    });

    // Lets SSE streams end cleanly on shutdown
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        bootstrap: BootstrapSettings {
            sudoers_path: daemon_config.sudoers_path.clone(),
            binary,
            binary_name: daemon_config.tunnel_binary.clone(),
        },
        geo: GeoClient::new(daemon_config.ip_info_url.clone())?,
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = if let Some(token) = auth_token {
        let auth_state = auth::AuthState::new(token);
        create_router(state).layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
    } else {
        create_router(state)
    };

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, supervisor, shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            let bind_address =
                vpnctl_common::format_host_port(&daemon_config.bind_host, daemon_config.bind_port);
            serve_tcp_http(app, &bind_address, supervisor, shutdown_tx).await?;
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Serve on a Unix domain socket
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    supervisor: ConnectionSupervisor,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(supervisor).await;
        let _ = shutdown_broadcast.send(());
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // `vpnctl watch` interrupted with Ctrl+C
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on loopback TCP
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    supervisor: ConnectionSupervisor,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

async fn shutdown_signal(
    supervisor: ConnectionSupervisor,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    wait_for_shutdown(supervisor).await;
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM, then terminate the tunnel this daemon launched
async fn wait_for_shutdown(supervisor: ConnectionSupervisor) {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler ({}), only Ctrl+C will stop the daemon", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        }
    }

    supervisor.shutdown().await;
    info!("VPN process stopped");
}
