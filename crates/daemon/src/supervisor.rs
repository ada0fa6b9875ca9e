// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 vpnctl Contributors

// vpnctl - Connection Supervisor
// Owns the single connection slot and serializes start/stop transitions

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vpnctl_common::{
    ConnectionEvent, ConnectionState, Error, Location, LocationInfo, Result, StatusReport,
};

use crate::config::DaemonConfig;
use crate::probe::ProcessProbe;
use crate::registry::{ConnectionProfile, ProfileRegistry};
use crate::runner::{LaunchRequest, Launched, ProcessExit, TunnelProcess, TunnelRunner};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tunables for launching and watching the tunnel process
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Resolved tunnel binary; None when it could not be found at startup
    pub binary: Option<PathBuf>,
    /// Name used for broad termination and error messages
    pub process_name: String,
    pub start_grace: Duration,
    pub start_timeout: Duration,
    pub ready_marker: Option<String>,
    pub monitor_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig, binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            process_name: config.tunnel_process_name(),
            start_grace: config.start_grace(),
            start_timeout: config.start_timeout(),
            ready_marker: config.ready_marker().map(str::to_string),
            monitor_interval: config.monitor_interval(),
        }
    }
}

/// How the wait for readiness ended
enum Readiness {
    Ready,
    Exited(std::io::Result<ProcessExit>),
    TimedOut,
}

struct Inner {
    registry: ProfileRegistry,
    probe: Arc<dyn ProcessProbe>,
    runner: Arc<dyn TunnelRunner>,
    settings: SupervisorSettings,
    state: RwLock<ConnectionState>,
    location: RwLock<Option<Location>>,
    handle: Mutex<Option<Box<dyn TunnelProcess>>>,
    /// Held for the whole of a start or stop; only ever taken with try_lock
    transition: Mutex<()>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

/// Supervisor for the one VPN connection this daemon manages
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: ProfileRegistry,
        probe: Arc<dyn ProcessProbe>,
        runner: Arc<dyn TunnelRunner>,
        settings: SupervisorSettings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry,
                probe,
                runner,
                settings,
                state: RwLock::new(ConnectionState::Idle),
                location: RwLock::new(None),
                handle: Mutex::new(None),
                transition: Mutex::new(()),
                event_tx,
            }),
        }
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot of the believed state
    pub async fn state(&self) -> ConnectionState {
        self.inner.state.read().await.clone()
    }

    pub async fn location(&self) -> Option<Location> {
        *self.inner.location.read().await
    }

    pub fn locations(&self) -> Vec<LocationInfo> {
        self.inner.registry.profiles()
    }

    /// Start the tunnel for a location and wait until it is up.
    ///
    /// The transition runs on its own task: a caller that goes away (an HTTP
    /// client disconnecting) does not abandon a half-launched process.
    pub async fn start(&self, key: &str) -> Result<String> {
        let profile = self.inner.registry.resolve(key)?.clone();
        let this = self.clone();
        detach(async move { this.run_start(profile).await }).await
    }

    async fn run_start(&self, profile: ConnectionProfile) -> Result<String> {
        let _transition = self
            .inner
            .transition
            .try_lock()
            .map_err(|_| Error::AlreadyRunningOrStarting)?;

        self.reconcile_stale().await?;

        if !ProfileRegistry::validate(&profile.config_path) {
            return Err(Error::ConfigNotFound(profile.config_path));
        }

        let binary = self
            .inner
            .settings
            .binary
            .clone()
            .ok_or_else(|| Error::BinaryNotFound(self.inner.settings.process_name.clone()))?;

        info!("Starting VPN for {} using {}", profile.location, profile.config_path.display());
        self.set_state(ConnectionState::Starting).await;
        *self.inner.location.write().await = Some(profile.location);
        self.emit(ConnectionEvent::Starting {
            location: profile.location,
        });

        let request = LaunchRequest {
            binary,
            config_path: profile.config_path.clone(),
            ready_marker: self.inner.settings.ready_marker.clone(),
        };

        let launched = match self.inner.runner.launch(&request).await {
            Ok(launched) => launched,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };

        let Launched { mut process, ready } = launched;
        match self.await_ready(process.as_mut(), ready).await {
            Readiness::Ready => {
                let pid = process.pid();
                *self.inner.handle.lock().await = Some(process);
                self.set_state(ConnectionState::Active).await;
                info!("VPN for {} is up (pid {:?})", profile.location, pid);
                self.emit(ConnectionEvent::Connected {
                    location: profile.location,
                    pid,
                });
                Ok("VPN started successfully!".to_string())
            }
            Readiness::Exited(Ok(exit)) => {
                let e = Error::ProcessLaunchFailed(exit.code);
                self.fail(&e).await;
                Err(e)
            }
            Readiness::Exited(Err(io)) => {
                let e = Error::Io(io);
                self.fail(&e).await;
                Err(e)
            }
            Readiness::TimedOut => {
                if let Err(e) = process.terminate().await {
                    warn!("Failed to terminate unresponsive VPN process: {}", e);
                }
                let e = Error::StartTimeout(self.inner.settings.start_timeout);
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Stop the tunnel. Succeeds when nothing is running.
    pub async fn stop(&self) -> Result<String> {
        let this = self.clone();
        detach(async move { this.run_stop().await }).await
    }

    async fn run_stop(&self) -> Result<String> {
        let _transition = self
            .inner
            .transition
            .try_lock()
            .map_err(|_| Error::TransitionInProgress)?;

        info!("Stopping VPN");
        self.set_state(ConnectionState::Stopping).await;
        self.emit(ConnectionEvent::Stopping);

        let held = self.inner.handle.lock().await.take();
        if let Some(mut process) = held {
            if let Err(e) = process.terminate().await {
                warn!("Failed to terminate held VPN process: {}", e);
            }
        }

        // Also catches tunnels this daemon did not launch
        match self
            .inner
            .runner
            .terminate_all(&self.inner.settings.process_name)
            .await
        {
            Ok(matched) => {
                if !matched {
                    debug!("No {} processes were running", self.inner.settings.process_name);
                }
                self.set_state(ConnectionState::Idle).await;
                *self.inner.location.write().await = None;
                self.emit(ConnectionEvent::Stopped);
                info!("VPN stopped");
                Ok("VPN stopped successfully!".to_string())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Ground-truth status; never blocks on an in-flight transition
    pub async fn status(&self) -> Result<StatusReport> {
        self.reap_held().await;
        let probe = self.inner.probe.detect().await?;
        Ok(StatusReport {
            active: probe.is_active,
            evidence: probe.evidence,
            state: self.state().await,
            location: self.location().await,
        })
    }

    /// Kill the process we launched, if any. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let held = self.inner.handle.lock().await.take();
        if let Some(mut process) = held {
            info!("Terminating VPN process {:?}", process.pid());
            if let Err(e) = process.terminate().await {
                error!("Failed to terminate VPN process on shutdown: {}", e);
            }
        }
        self.set_state(ConnectionState::Idle).await;
        *self.inner.location.write().await = None;
    }

    /// Watch the held process and record unexpected exits
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.monitor_interval;
        tokio::spawn(monitor_loop(weak, interval))
    }

    /// Collect the exit status of a dead child so it does not linger as a
    /// zombie in the process table
    async fn reap_held(&self) {
        let Ok(mut slot) = self.inner.handle.try_lock() else {
            return;
        };
        if let Some(process) = slot.as_mut() {
            if let Err(e) = process.try_wait() {
                debug!("Could not poll VPN process: {}", e);
            }
        }
    }

    async fn await_ready(
        &self,
        process: &mut dyn TunnelProcess,
        mut ready: tokio::sync::oneshot::Receiver<()>,
    ) -> Readiness {
        let settings = &self.inner.settings;
        let has_marker = settings.ready_marker.is_some();

        tokio::select! {
            exit = process.wait() => Readiness::Exited(exit),
            Ok(()) = &mut ready, if has_marker => Readiness::Ready,
            _ = tokio::time::sleep(settings.start_grace), if !has_marker => Readiness::Ready,
            _ = tokio::time::sleep(settings.start_timeout) => Readiness::TimedOut,
        }
    }

    /// Reset a believed state that no process backs anymore. Runs with the
    /// transition lock held, so Starting or Stopping here were left behind by
    /// a transition that never finished. A live tunnel blocks start.
    async fn reconcile_stale(&self) -> Result<()> {
        let state = self.state().await;
        if matches!(state, ConnectionState::Idle | ConnectionState::Failed(_)) {
            return Ok(());
        }

        let exited = {
            let mut slot = self.inner.handle.lock().await;
            match slot.as_mut() {
                Some(process) => match process.try_wait() {
                    Ok(exit) => exit.is_some(),
                    Err(e) => {
                        warn!("Could not poll VPN process: {}", e);
                        true
                    }
                },
                None => true,
            }
        };

        if !exited && self.inner.probe.detect().await?.is_active {
            return Err(Error::AlreadyRunningOrStarting);
        }

        warn!("Believed {:?} VPN is no longer running, resetting to idle", state);
        let held = self.inner.handle.lock().await.take();
        if let Some(mut process) = held {
            if let Err(e) = process.terminate().await {
                warn!("Failed to terminate stale VPN process: {}", e);
            }
        }
        self.set_state(ConnectionState::Idle).await;
        *self.inner.location.write().await = None;
        self.emit(ConnectionEvent::Disconnected {
            reason: "VPN process is no longer running".to_string(),
        });
        Ok(())
    }

    async fn fail(&self, e: &Error) {
        error!("VPN transition failed: {}", e);
        self.set_state(ConnectionState::Failed(e.to_string())).await;
        self.emit(ConnectionEvent::Failed {
            error: e.to_string(),
        });
    }

    async fn set_state(&self, state: ConnectionState) {
        set_state(&self.inner, state).await;
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }
}

/// Run a transition to completion even if the awaiting caller is dropped
async fn detach<F>(transition: F) -> Result<String>
where
    F: std::future::Future<Output = Result<String>> + Send + 'static,
{
    tokio::spawn(transition)
        .await
        .map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("VPN transition task failed: {}", e),
            ))
        })?
}

async fn set_state(inner: &Inner, state: ConnectionState) {
    let mut current = inner.state.write().await;
    debug!("State {:?} -> {:?}", *current, state);
    *current = state;
}

async fn monitor_loop(weak: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            debug!("Supervisor dropped, monitor exiting");
            return;
        };

        // A start or stop owns the handle right now
        let Ok(_transition) = inner.transition.try_lock() else {
            continue;
        };

        if *inner.state.read().await != ConnectionState::Active {
            continue;
        }

        let exit = {
            let mut slot = inner.handle.lock().await;
            let polled = match slot.as_mut() {
                Some(process) => process.try_wait(),
                None => continue,
            };
            match polled {
                Ok(Some(exit)) => {
                    slot.take();
                    exit
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not poll VPN process: {}", e);
                    continue;
                }
            }
        };

        let (state, reason) = match exit.code {
            Some(0) => (ConnectionState::Idle, "VPN process exited".to_string()),
            Some(code) => {
                let reason = format!("VPN process exited with code {}", code);
                (ConnectionState::Failed(reason.clone()), reason)
            }
            None => {
                let reason = "VPN process was killed by a signal".to_string();
                (ConnectionState::Failed(reason.clone()), reason)
            }
        };
        warn!("{}", reason);
        set_state(&inner, state).await;
        *inner.location.write().await = None;
        let _ = inner.event_tx.send(ConnectionEvent::Disconnected { reason });
    }
}
