// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - CLI Client
// Command-line interface for the vpnctl daemon

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use reqwest::Client;

use vpnctl_common::{
    ConnectionEvent, ConnectionState, EventListener, Evidence, Location, StatusReport,
};

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(about = "Control the local VPN daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a location (france, usa, uk, australia, uae)
    Start {
        location: String,
    },

    /// Disconnect
    Stop,

    /// Show whether a VPN is active
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List known locations and whether their configuration is installed
    Locations {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Allow the current user to run the tunnel binary through sudo without a password
    AddSudoers,

    /// Show the public IP and where traffic currently exits
    IpInfo,

    /// Stream connection events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { location } => start_vpn(location).await?,
        Commands::Stop => stop_vpn().await?,
        Commands::Status { json } => show_status(json).await?,
        Commands::Locations { json } => list_locations(json).await?,
        Commands::AddSudoers => add_sudoers().await?,
        Commands::IpInfo => show_ip_info().await?,
        Commands::Watch => watch_events().await?,
    }

    Ok(())
}

/// Create an HTTP client configured to connect to the daemon
fn daemon_client() -> Result<(Client, config::CliConfig)> {
    let cli_config = config::CliConfig::load()?;
    let client = vpnctl_common::create_daemon_client(&cli_config.daemon_config)?;
    Ok((client, cli_config))
}

async fn start_vpn(location: String) -> Result<()> {
    let (client, cli_config) = daemon_client()?;

    println!("{}", format!("Connecting to {}...", location).cyan());
    let message = vpnctl_common::start_vpn(&client, &cli_config.daemon_config, &location)
        .await
        .with_context(|| format!("Could not start VPN for '{}'", location))?;

    println!("{}", format!("✓ {}", message).green().bold());
    Ok(())
}

async fn stop_vpn() -> Result<()> {
    let (client, cli_config) = daemon_client()?;

    println!("{}", "Disconnecting...".yellow());
    let message = vpnctl_common::stop_vpn(&client, &cli_config.daemon_config).await?;

    println!("{}", format!("✓ {}", message).green().bold());
    Ok(())
}

async fn show_status(json: bool) -> Result<()> {
    let (client, cli_config) = daemon_client()?;
    let report = vpnctl_common::fetch_status(&client, &cli_config.daemon_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    if report.active {
        println!("{}", report.message().green().bold());
    } else {
        println!("{}", report.message().yellow().bold());
    }

    if let Some(evidence) = evidence_label(report.evidence) {
        println!("  {} {}", "Detected by:".dimmed(), evidence);
    }
    println!("  {} {}", "Daemon state:".dimmed(), state_label(&report.state));
    if let Some(location) = report.location {
        println!("  {} {}", "Location:".dimmed(), location);
    }
}

fn evidence_label(evidence: Evidence) -> Option<&'static str> {
    match evidence {
        Evidence::ProcessTableMatch => Some("tunnel process running"),
        Evidence::RouteTableMatch => Some("default route through a tunnel interface"),
        Evidence::None => None,
    }
}

fn state_label(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Idle => "idle".to_string(),
        ConnectionState::Starting => "starting".to_string(),
        ConnectionState::Active => "active".to_string(),
        ConnectionState::Stopping => "stopping".to_string(),
        ConnectionState::Failed(reason) => format!("failed ({})", reason),
    }
}

async fn list_locations(json: bool) -> Result<()> {
    let (client, cli_config) = daemon_client()?;
    let response = vpnctl_common::fetch_locations(&client, &cli_config.daemon_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let width = Location::ALL
        .iter()
        .map(|l| l.key().len())
        .max()
        .unwrap_or(0);
    for info in &response.locations {
        let marker = if info.available {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "{} {:<width$}  {}",
            marker,
            info.location.key(),
            info.config_path.display().to_string().dimmed(),
            width = width
        );
    }
    if response.locations.iter().any(|l| !l.available) {
        println!();
        println!(
            "{}",
            "Locations marked ✗ have no configuration file on the daemon host.".dimmed()
        );
    }
    Ok(())
}

async fn add_sudoers() -> Result<()> {
    let (client, cli_config) = daemon_client()?;
    let message = vpnctl_common::add_sudoers(&client, &cli_config.daemon_config).await?;
    println!("{}", format!("✓ {}", message).green());
    Ok(())
}

async fn show_ip_info() -> Result<()> {
    let (client, cli_config) = daemon_client()?;
    let info = vpnctl_common::fetch_ip_info(&client, &cli_config.daemon_config).await?;

    for key in ["ip", "city", "region", "country", "org"] {
        if let Some(value) = info.get(key).and_then(|v| v.as_str()) {
            println!("{:>8}: {}", key.dimmed(), value);
        }
    }
    Ok(())
}

async fn watch_events() -> Result<()> {
    let cli_config = config::CliConfig::load()?;
    let listener = EventListener::new(cli_config.daemon_config);
    let mut events = listener.listen().await?;

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
        }
    }

    Ok(())
}

fn print_event(event: &ConnectionEvent) {
    let Some(line) = describe_event(event) else {
        return;
    };
    match event {
        ConnectionEvent::Connected { .. } | ConnectionEvent::Stopped => {
            println!("{}", line.green())
        }
        ConnectionEvent::Disconnected { .. } => println!("{}", line.yellow()),
        ConnectionEvent::Failed { .. } => eprintln!("{}", line.red()),
        _ => println!("{}", line.cyan()),
    }
}

/// One line per event; heartbeats are silent
fn describe_event(event: &ConnectionEvent) -> Option<String> {
    let line = match event {
        ConnectionEvent::Starting { location } => format!("Connecting to {}", location),
        ConnectionEvent::Connected { location, pid } => match pid {
            Some(pid) => format!("Connected to {} (pid {})", location, pid),
            None => format!("Connected to {}", location),
        },
        ConnectionEvent::Stopping => "Disconnecting".to_string(),
        ConnectionEvent::Stopped => "Disconnected".to_string(),
        ConnectionEvent::Disconnected { reason } => format!("Connection lost: {}", reason),
        ConnectionEvent::Failed { error } => format!("Error: {}", error),
        ConnectionEvent::Heartbeat { .. } => return None,
    };
    Some(line)
}
