// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Privilege Bootstrap
// Grants the current user password-less sudo for the tunnel binary

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use vpnctl_common::{Error, Result};

/// Serializes policy edits within this process; flock covers other processes
static POLICY_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyPresent,
    Added,
}

impl BootstrapOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            BootstrapOutcome::AlreadyPresent => "Sudoers entry already exists",
            BootstrapOutcome::Added => "Sudoers entry added successfully!",
        }
    }
}

/// Login name of the user running the daemon
pub fn current_user() -> Result<String> {
    users::get_current_username()
        .ok_or_else(|| Error::PolicyUpdate("Could not determine current user".into()))?
        .into_string()
        .map_err(|name| Error::PolicyUpdate(format!("User name is not valid UTF-8: {:?}", name)))
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::PolicyUpdate(format!("{} is empty", what)));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '#') {
        return Err(Error::PolicyUpdate(format!(
            "{} contains whitespace or '#': {:?}",
            what, value
        )));
    }
    Ok(())
}

/// The exact line granted to `user`, newline included
pub fn sudoers_entry(user: &str, binary: &Path) -> Result<String> {
    check_token("User name", user)?;
    if !binary.is_absolute() {
        return Err(Error::PolicyUpdate(format!(
            "Binary path must be absolute: {}",
            binary.display()
        )));
    }
    let binary = binary.to_str().ok_or_else(|| {
        Error::PolicyUpdate(format!("Binary path is not valid UTF-8: {}", binary.display()))
    })?;
    check_token("Binary path", binary)?;

    Ok(format!("{} ALL=(ALL) NOPASSWD: {}\n", user, binary))
}

/// Append the entry unless an identical line is already there. Blocking.
pub fn ensure_elevated_invocation_blocking(
    policy_path: &Path,
    user: &str,
    binary: &Path,
) -> Result<BootstrapOutcome> {
    let entry = sudoers_entry(user, binary)?;
    let wanted = entry.trim_end_matches('\n');

    let _guard = POLICY_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(policy_path)
        .map_err(|e| Error::PolicyUpdate(format!("{}: {}", policy_path.display(), e)))?;

    // Released when the file is closed
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
        return Err(Error::PolicyUpdate(format!(
            "Failed to lock {}: {}",
            policy_path.display(),
            std::io::Error::last_os_error()
        )));
    }

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| Error::PolicyUpdate(format!("Failed to read {}: {}", policy_path.display(), e)))?;

    if content.lines().any(|line| line == wanted) {
        debug!("Sudoers entry already present in {}", policy_path.display());
        return Ok(BootstrapOutcome::AlreadyPresent);
    }

    let mut addition = String::with_capacity(entry.len() + 1);
    if !content.is_empty() && !content.ends_with('\n') {
        addition.push('\n');
    }
    addition.push_str(&entry);

    file.write_all(addition.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::PolicyUpdate(format!("Failed to write {}: {}", policy_path.display(), e)))?;

    info!("Added sudoers entry for {} to {}", user, policy_path.display());
    Ok(BootstrapOutcome::Added)
}

/// Async wrapper running the file edit on the blocking pool
pub async fn ensure_elevated_invocation(
    policy_path: PathBuf,
    user: String,
    binary: PathBuf,
) -> Result<BootstrapOutcome> {
    tokio::task::spawn_blocking(move || {
        ensure_elevated_invocation_blocking(&policy_path, &user, &binary)
    })
    .await
    .map_err(|e| Error::PolicyUpdate(format!("Policy update task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn policy_file(content: &str) -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sudoers");
        fs::write(&path, content).unwrap();
        (temp_dir, path)
    }

    #[test]
    fn test_entry_format() {
        assert_eq!(
            sudoers_entry("alice", Path::new("/usr/sbin/openvpn")).unwrap(),
            "alice ALL=(ALL) NOPASSWD: /usr/sbin/openvpn\n"
        );
    }

    #[test]
    fn test_entry_rejects_injection() {
        let binary = Path::new("/usr/sbin/openvpn");
        for user in ["", "alice bob", "alice\nroot ALL=(ALL) ALL", "al#ice"] {
            assert!(matches!(
                sudoers_entry(user, binary),
                Err(Error::PolicyUpdate(_))
            ));
        }
        for binary in ["openvpn", "/opt/open vpn/openvpn", "/usr/sbin/openvpn\nALL"] {
            assert!(matches!(
                sudoers_entry("alice", Path::new(binary)),
                Err(Error::PolicyUpdate(_))
            ));
        }
    }

    #[test]
    fn test_repeated_calls_leave_file_unchanged() {
        let (_dir, path) = policy_file("root ALL=(ALL) ALL\n");
        let binary = Path::new("/usr/sbin/openvpn");

        assert_eq!(
            ensure_elevated_invocation_blocking(&path, "alice", binary).unwrap(),
            BootstrapOutcome::Added
        );
        let after_first = fs::read_to_string(&path).unwrap();
        assert_eq!(
            after_first,
            "root ALL=(ALL) ALL\nalice ALL=(ALL) NOPASSWD: /usr/sbin/openvpn\n"
        );

        for _ in 0..3 {
            assert_eq!(
                ensure_elevated_invocation_blocking(&path, "alice", binary).unwrap(),
                BootstrapOutcome::AlreadyPresent
            );
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), after_first);
    }

    #[test]
    fn test_missing_trailing_newline_is_repaired() {
        let (_dir, path) = policy_file("root ALL=(ALL) ALL");
        ensure_elevated_invocation_blocking(&path, "bob", Path::new("/usr/local/bin/openvpn"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "root ALL=(ALL) ALL\nbob ALL=(ALL) NOPASSWD: /usr/local/bin/openvpn\n"
        );
    }

    #[test]
    fn test_similar_entry_does_not_count() {
        // Commented out, or for another binary
        let (_dir, path) = policy_file(
            "# alice ALL=(ALL) NOPASSWD: /usr/sbin/openvpn\n\
             alice ALL=(ALL) NOPASSWD: /usr/sbin/openvpn2\n",
        );
        assert_eq!(
            ensure_elevated_invocation_blocking(&path, "alice", Path::new("/usr/sbin/openvpn"))
                .unwrap(),
            BootstrapOutcome::Added
        );
    }

    #[test]
    fn test_missing_policy_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent");
        assert!(matches!(
            ensure_elevated_invocation_blocking(&path, "alice", Path::new("/usr/sbin/openvpn")),
            Err(Error::PolicyUpdate(_))
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_calls_append_once() {
        let (_dir, path) = policy_file("");
        let mut tasks = Vec::new();
        for _ in 0..8 {
            tasks.push(ensure_elevated_invocation(
                path.clone(),
                "carol".into(),
                PathBuf::from("/usr/sbin/openvpn"),
            ));
        }
        let outcomes = futures::future::join_all(tasks).await;
        let added = outcomes
            .into_iter()
            .map(|o| o.unwrap())
            .filter(|o| *o == BootstrapOutcome::Added)
            .count();
        assert_eq!(added, 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "carol ALL=(ALL) NOPASSWD: /usr/sbin/openvpn\n"
        );
    }
}
