// Permission hardening for the daemon's runtime directory and control socket

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

/// Set umask 0077 so everything the daemon creates is owner-only.
/// Call before creating any files.
pub fn set_restrictive_umask() {
    unsafe {
        libc::umask(0o077);
    }
    debug!("Set restrictive umask: 0077");
}

fn directory_mode(group_access: bool) -> u32 {
    if group_access {
        0o770
    } else {
        0o700
    }
}

fn socket_mode(group_access: bool) -> u32 {
    if group_access {
        0o660
    } else {
        0o600
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .context(format!("Failed to set permissions on {}", path.display()))
}

/// Control socket: 0600, or 0660 when the group may drive the VPN too
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    let mode = socket_mode(group_access);
    set_mode(path, mode)?;
    info!("Set socket permissions to {:o}: {}", mode, path.display());
    Ok(())
}

/// Create the directory if needed, then set 0700 (or 0770 with group access)
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    let mode = directory_mode(group_access);
    set_mode(path, mode)?;
    info!("Set directory permissions to {:o}: {}", mode, path.display());
    Ok(())
}
