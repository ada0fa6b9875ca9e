// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Tunnel Runner
// Launches the tunnel binary, drains its output and terminates it

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use vpnctl_common::{Error, Result};

/// How long a process gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Exit of the tunnel process; `code` is None when it died from a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// Handle to a launched tunnel process, exclusively owned by the supervisor
#[async_trait]
pub trait TunnelProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait until the process exits
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> std::io::Result<Option<ProcessExit>>;

    /// Ask the process to exit, forcing it if it does not
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub binary: PathBuf,
    pub config_path: PathBuf,
    /// Line on stdout/stderr that means the tunnel is up
    pub ready_marker: Option<String>,
}

/// A freshly launched process plus its readiness signal
pub struct Launched {
    pub process: Box<dyn TunnelProcess>,
    /// Fires once when the readiness marker is seen. The sender is dropped
    /// without firing when no marker is configured or the output closes.
    pub ready: oneshot::Receiver<()>,
}

/// Process-level side effects of the supervisor
#[async_trait]
pub trait TunnelRunner: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Launched>;

    /// Terminate every process with this name, not only the one we launched.
    /// Returns false when nothing matched.
    async fn terminate_all(&self, process_name: &str) -> Result<bool>;
}

/// Runner backed by tokio::process, optionally going through `sudo -n`
pub struct CommandRunner {
    use_sudo: bool,
}

impl CommandRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn command(&self, program: &OsStr) -> Command {
        if self.use_sudo {
            let mut command = Command::new("sudo");
            // Never prompt: a missing sudoers entry must fail, not hang
            command.arg("-n").arg(program);
            command
        } else {
            Command::new(program)
        }
    }
}

#[async_trait]
impl TunnelRunner for CommandRunner {
    async fn launch(&self, request: &LaunchRequest) -> Result<Launched> {
        let mut command = self.command(request.binary.as_os_str());
        command
            .arg("--config")
            .arg(&request.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", request.binary.display(), e)))?;

        info!(
            "Launched {} --config {} (pid {:?})",
            request.binary.display(),
            request.config_path.display(),
            child.id()
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx = Arc::new(Mutex::new(Some(ready_tx)));
        if request.ready_marker.is_none() {
            drop(ready_tx.lock().ok().and_then(|mut slot| slot.take()));
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(
                stdout,
                OutputStream::Stdout,
                request.ready_marker.clone(),
                ready_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(
                stderr,
                OutputStream::Stderr,
                request.ready_marker.clone(),
                ready_tx,
            ));
        }

        Ok(Launched {
            process: Box::new(ChildProcess { child }),
            ready: ready_rx,
        })
    }

    async fn terminate_all(&self, process_name: &str) -> Result<bool> {
        let output = self
            .command(OsStr::new("pkill"))
            .arg("-x")
            .arg(process_name)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::TerminationFailed(format!("Failed to run pkill: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => {
                debug!("Terminated all {} processes", process_name);
                Ok(true)
            }
            // pkill: 1 = no process matched. sudo also exits 1 but says why on stderr.
            Some(1) if stderr.trim().is_empty() => Ok(false),
            _ => Err(Error::TerminationFailed(if stderr.trim().is_empty() {
                format!("pkill exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            })),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Log every line of the child's output, firing the readiness signal on the marker
async fn drain_output<R>(
    reader: R,
    stream: OutputStream,
    marker: Option<String>,
    ready_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    OutputStream::Stdout => info!(target: "vpnctl_daemon::tunnel", "VPN Output: {}", line),
                    OutputStream::Stderr => warn!(target: "vpnctl_daemon::tunnel", "VPN Error: {}", line),
                }
                if marker.as_deref().is_some_and(|m| line.contains(m)) {
                    if let Some(tx) = ready_tx.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading tunnel {:?}: {}", stream, e);
                break;
            }
        }
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit { code: status.code() })
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ProcessExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProcessExit { code: status.code() }))
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        // SIGTERM first: sudo relays it to the tunnel process, SIGKILL it cannot
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if result == 0 {
                if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
                    .await
                    .is_ok()
                {
                    return Ok(());
                }
                warn!("Tunnel process {} ignored SIGTERM, killing it", pid);
            }
        }

        self.child.kill().await
    }
}

/// Locate the tunnel binary: absolute or relative paths are taken as-is,
/// bare names are searched on PATH
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use vpnctl_common::ProbeResult;

    use crate::probe::{ProcessProbe, PsProcessTable, RouteInspector, SystemProbe};

    // Exec right after writing can hit ETXTBSY while another test thread forks
    async fn launch_retrying(runner: &CommandRunner, request: LaunchRequest) -> Launched {
        for _ in 0..10 {
            match runner.launch(&request).await {
                Err(Error::SpawnFailed(msg)) if msg.contains("busy") => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => return other.unwrap(),
            }
        }
        panic!("could not launch {}", request.binary.display());
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_resolve_binary_explicit_path() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(temp_dir.path(), "fakevpn", "exit 0");
        assert_eq!(resolve_binary(script.to_str().unwrap()), Some(script.clone()));

        let not_exec = temp_dir.path().join("plain");
        std::fs::write(&not_exec, "data").unwrap();
        assert_eq!(resolve_binary(not_exec.to_str().unwrap()), None);
        assert_eq!(resolve_binary(temp_dir.path().to_str().unwrap()), None);
    }

    #[test]
    fn test_resolve_binary_missing_name() {
        assert_eq!(resolve_binary("vpnctl-no-such-binary-9c1e"), None);
    }

    #[test]
    fn test_resolve_binary_finds_sh_on_path() {
        let found = resolve_binary("sh").expect("sh should be on PATH");
        assert!(found.is_absolute());
        assert!(found.ends_with("sh"));
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code_and_config_arg() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(
            temp_dir.path(),
            "fakevpn",
            "[ \"$1\" = \"--config\" ] || exit 9\necho \"using $2\"\nexit 3",
        );
        let runner = CommandRunner::new(false);
        let mut launched = launch_retrying(
            &runner,
            LaunchRequest {
                binary: script,
                config_path: temp_dir.path().join("uknewclient.ovpn"),
                ready_marker: None,
            },
        )
        .await;

        let exit = launched.process.wait().await.unwrap();
        assert_eq!(exit, ProcessExit { code: Some(3) });
        // No marker configured: the readiness channel never fires
        assert!(launched.ready.await.is_err());
    }

    #[tokio::test]
    async fn test_launch_fires_ready_on_marker() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(
            temp_dir.path(),
            "fakevpn",
            "echo 'Initialization Sequence Completed'\nsleep 30",
        );
        let runner = CommandRunner::new(false);
        let mut launched = launch_retrying(
            &runner,
            LaunchRequest {
                binary: script,
                config_path: temp_dir.path().join("x.ovpn"),
                ready_marker: Some("Initialization Sequence Completed".into()),
            },
        )
        .await;

        tokio::time::timeout(Duration::from_secs(5), &mut launched.ready)
            .await
            .expect("marker not seen")
            .expect("sender dropped");
        assert!(launched.process.try_wait().unwrap().is_none());

        launched.process.terminate().await.unwrap();
        assert!(launched.process.try_wait().unwrap().is_some());
    }

    struct NoDefaultRoute;

    #[async_trait]
    impl RouteInspector for NoDefaultRoute {
        async fn default_interface(&self) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_externally_killed_child_is_not_reported_active() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(
            temp_dir.path(),
            "vpnctlzombie",
            "while true; do sleep 1; done",
        );
        let runner = CommandRunner::new(false);
        let launched = launch_retrying(
            &runner,
            LaunchRequest {
                binary: script,
                config_path: temp_dir.path().join("x.ovpn"),
                ready_marker: None,
            },
        )
        .await;
        let pid = launched.process.pid().unwrap();

        let probe = SystemProbe::new(
            "vpnctlzombie",
            vec!["tun".into()],
            Box::new(PsProcessTable),
            Box::new(NoDefaultRoute),
        );
        assert!(probe.detect().await.unwrap().is_active);

        // Killed behind the daemon's back and not yet reaped
        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) }, 0);
        let mut result = probe.detect().await.unwrap();
        for _ in 0..50 {
            if !result.is_active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            result = probe.detect().await.unwrap();
        }
        assert_eq!(result, ProbeResult::inactive());
        drop(launched);
    }

    #[tokio::test]
    async fn test_launch_missing_binary_is_spawn_failure() {
        let runner = CommandRunner::new(false);
        let result = runner
            .launch(&LaunchRequest {
                binary: PathBuf::from("/nonexistent/vpnctl/openvpn"),
                config_path: PathBuf::from("/nonexistent/x.ovpn"),
                ready_marker: None,
            })
            .await;
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }
}
