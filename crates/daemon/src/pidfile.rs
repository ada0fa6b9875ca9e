// vpnctl - PID File Management
// Ensures only one daemon instance supervises the tunnel

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config;

/// PID file guard - removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create the PID file in the runtime directory
    pub fn create() -> Result<Self> {
        Self::create_at(&config::runtime_dir()?.join("daemon.pid"))
    }

    /// Create a PID file at `path`, failing if a live daemon already owns it
    pub fn create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if Self::is_process_running(pid) {
                            anyhow::bail!(
                                "Daemon is already running with PID {}. \
                                 Stop the existing daemon first or remove {} if it's stale.",
                                pid,
                                path.display()
                            );
                        }
                        warn!(
                            "Found stale PID file for process {} (not running), removing it",
                            pid
                        );
                    }
                    fs::remove_file(path).context("Failed to remove stale PID file")?;
                }
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(path);
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// kill(pid, 0) probes existence without signalling
    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: it exists but belongs to someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        warn!("Process existence check not implemented for this platform");
        true
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_prevents_multiple_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run").join("daemon.pid");

        let guard = PidFileGuard::create_at(&path).expect("first instance should succeed");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        let err = PidFileGuard::create_at(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(guard);
        assert!(!path.exists());
        let _guard = PidFileGuard::create_at(&path).expect("should succeed after drop");
    }

    #[test]
    fn test_stale_and_garbage_pid_files_are_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");

        fs::write(&path, "999999999").unwrap();
        let guard = PidFileGuard::create_at(&path).unwrap();
        drop(guard);

        fs::write(&path, "not a pid").unwrap();
        let _guard = PidFileGuard::create_at(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(PidFileGuard::is_process_running(std::process::id()));
    }
}
