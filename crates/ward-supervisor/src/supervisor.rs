//! Gateway supervisor: keeps exactly one healthy gateway process alive.
//!
//! The handle of the process we launch is kept in an in-memory registry.
//! Scanning the process table is only a fallback, used after the supervisor
//! itself has restarted and lost its registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use ward_types::control::StatusReport;
use ward_types::gateway_config::GatewayConfig;
use ward_types::process::{GatewayProcess, GatewayState};
use ward_types::settings::{GatewaySettings, WardenSettings};

use crate::error::{WardenError, WardenResult};
use crate::host::{LaunchCommand, ProcessHost};

/// Pause between startup health probes.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Extra wait after a forced kill, before giving up on the old process.
const FORCE_KILL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub port: u16,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&WardenSettings> for SupervisorOptions {
    fn from(s: &WardenSettings) -> Self {
        Self {
            port: s.gateway.port,
            probe_timeout: Duration::from_millis(s.supervisor.probe_timeout_ms),
            grace_period: Duration::from_millis(s.supervisor.grace_period_ms),
            startup_timeout: Duration::from_secs(s.supervisor.startup_timeout_secs),
            poll_interval: STARTUP_POLL_INTERVAL,
        }
    }
}

pub struct Supervisor {
    host: Arc<dyn ProcessHost>,
    gateway: GatewaySettings,
    opts: SupervisorOptions,
    registry: Mutex<Option<GatewayProcess>>,
    /// Serializes launch and restart. Restart requests that find it held
    /// are rejected rather than queued.
    lifecycle: Arc<Mutex<()>>,
}

impl Supervisor {
    pub fn new(
        host: Arc<dyn ProcessHost>,
        gateway: GatewaySettings,
        opts: SupervisorOptions,
    ) -> Self {
        Self {
            host,
            gateway,
            opts,
            registry: Mutex::new(None),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn port(&self) -> u16 {
        self.opts.port
    }

    /// The handle this supervisor currently holds, if any.
    pub async fn registered(&self) -> Option<GatewayProcess> {
        self.registry.lock().await.clone()
    }

    /// Locate the gateway process. Checks the registry first, then falls back
    /// to scanning for the launch signature and adopts whatever it finds.
    /// Only process existence is checked, not the network service.
    pub async fn find_existing(&self) -> WardenResult<Option<GatewayProcess>> {
        let registered = self.registry.lock().await.clone();
        if let Some(process) = registered {
            if self.host.is_alive(process.pid).await {
                return Ok(Some(process));
            }
            info!("Registered gateway process {} is gone", process.pid);
            self.clear_registry(process.pid).await;
        }

        let signature = LaunchCommand::signature(&self.gateway.binary);
        let found = self
            .host
            .find_by_signature(&signature)
            .await
            .map_err(|e| WardenError::Discovery(format!("{e:#}")))?;

        match found {
            Some(pid) => {
                info!("Adopting running gateway process {pid}");
                let process = GatewayProcess {
                    pid,
                    port: self.opts.port,
                    state: GatewayState::Running,
                    started_at: Utc::now(),
                    adopted: true,
                };
                *self.registry.lock().await = Some(process.clone());
                Ok(Some(process))
            }
            None => Ok(None),
        }
    }

    /// Bounded TCP probe against the process's port.
    pub async fn is_healthy(&self, process: &GatewayProcess, timeout: Duration) -> bool {
        probe_port(process.port, timeout).await
    }

    /// Current status, as reported to control API callers.
    pub async fn status(&self) -> StatusReport {
        match self.find_existing().await {
            Err(e) => StatusReport::error(e.to_string()),
            Ok(None) => StatusReport::not_running(),
            Ok(Some(process)) => {
                if self.is_healthy(&process, self.opts.probe_timeout).await {
                    self.set_state(process.pid, GatewayState::Running).await;
                    StatusReport::running(process.pid)
                } else {
                    self.set_state(process.pid, GatewayState::Unresponsive).await;
                    StatusReport::not_responding(process.pid)
                }
            }
        }
    }

    /// Idempotent: a healthy existing gateway is returned untouched.
    pub async fn ensure_running(&self, config: &GatewayConfig) -> WardenResult<GatewayProcess> {
        let _gate = self.lifecycle.lock().await;
        self.ensure_running_locked(config).await
    }

    /// Authorized synchronous restart. Waits for the new gateway to come up.
    pub async fn restart(
        &self,
        config: &GatewayConfig,
        token: Option<&str>,
    ) -> WardenResult<GatewayProcess> {
        authorize(config, token)?;
        let _gate = self.lifecycle.lock().await;
        self.restart_locked(config).await
    }

    /// Authorized restart that runs in the background. Returns the pid of the
    /// process being replaced; callers poll `status` to see the outcome.
    pub async fn schedule_restart(
        self: &Arc<Self>,
        config: GatewayConfig,
        token: Option<&str>,
    ) -> WardenResult<Option<u32>> {
        authorize(&config, token)?;
        let gate = self
            .lifecycle
            .clone()
            .try_lock_owned()
            .map_err(|_| WardenError::RestartInProgress)?;

        let previous = match self.find_existing().await {
            Ok(p) => p.map(|p| p.pid),
            Err(e) => {
                warn!("Process discovery failed before restart: {e}");
                None
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _gate = gate;
            match this.restart_locked(&config).await {
                Ok(p) => info!("Gateway restarted (pid: {})", p.pid),
                Err(e) => error!("Gateway restart failed: {e}"),
            }
        });

        Ok(previous)
    }

    async fn restart_locked(&self, config: &GatewayConfig) -> WardenResult<GatewayProcess> {
        let existing = match self.find_existing().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Process discovery failed during restart, relaunching anyway: {e}");
                None
            }
        };
        if let Some(process) = existing {
            info!("Restarting gateway (pid: {})", process.pid);
            self.set_state(process.pid, GatewayState::Restarting).await;
            self.terminate_and_wait(&process).await;
        }
        self.ensure_running_locked(config).await
    }

    async fn ensure_running_locked(&self, config: &GatewayConfig) -> WardenResult<GatewayProcess> {
        if let Some(process) = self.find_existing().await? {
            if self.is_healthy(&process, self.opts.probe_timeout).await {
                debug!("Gateway already running (pid: {})", process.pid);
                self.set_state(process.pid, GatewayState::Running).await;
                return Ok(GatewayProcess {
                    state: GatewayState::Running,
                    ..process
                });
            }
            warn!("Gateway process {} is not responding, replacing it", process.pid);
            self.set_state(process.pid, GatewayState::Unresponsive).await;
            self.set_state(process.pid, GatewayState::Restarting).await;
            self.terminate_and_wait(&process).await;
        }
        self.launch(config).await
    }

    async fn launch(&self, config: &GatewayConfig) -> WardenResult<GatewayProcess> {
        let bind = config
            .gateway
            .bind
            .clone()
            .unwrap_or_else(|| self.gateway.bind.clone());
        let token = config.auth_token();
        if token.is_none() {
            info!("No gateway token configured, launching in device-pairing mode");
        }
        let cmd = LaunchCommand::gateway(&self.gateway, self.opts.port, &bind, token);

        // Whatever holds the port would pass the startup health check for us.
        if probe_port(self.opts.port, self.opts.probe_timeout).await {
            return Err(WardenError::GatewayLaunchFailed(format!(
                "port {} already in use",
                self.opts.port
            )));
        }
        info!("Launching gateway: {}", cmd.redacted());

        let pid = self
            .host
            .spawn(&cmd)
            .await
            .map_err(|e| WardenError::GatewayLaunchFailed(format!("{e:#}")))?;

        let process = GatewayProcess {
            pid,
            port: self.opts.port,
            state: GatewayState::Starting,
            started_at: Utc::now(),
            adopted: false,
        };
        *self.registry.lock().await = Some(process.clone());

        let deadline = tokio::time::Instant::now() + self.opts.startup_timeout;
        loop {
            let healthy = self.is_healthy(&process, self.opts.probe_timeout).await;
            let alive = self.host.is_alive(pid).await;
            if healthy && !alive {
                self.clear_registry(pid).await;
                return Err(WardenError::GatewayLaunchFailed(format!(
                    "gateway process {pid} exited while port {} is held by another process",
                    self.opts.port
                )));
            }
            if healthy {
                info!("Gateway is up on port {} (pid: {pid})", self.opts.port);
                self.set_state(pid, GatewayState::Running).await;
                return Ok(GatewayProcess {
                    state: GatewayState::Running,
                    ..process
                });
            }
            if !alive {
                self.clear_registry(pid).await;
                return Err(WardenError::GatewayLaunchFailed(format!(
                    "gateway process {pid} exited during startup"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Gateway {pid} did not open port {} in time, stopping it", self.opts.port);
                self.terminate_and_wait(&process).await;
                return Err(WardenError::GatewayLaunchFailed(format!(
                    "gateway did not open port {} within {}s",
                    self.opts.port,
                    self.opts.startup_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.opts.poll_interval).await;
        }
    }

    /// Request termination, wait out the grace period, escalate if needed.
    /// Failures are logged, never returned: a relaunch follows regardless and
    /// will fail loudly if the port is still held.
    async fn terminate_and_wait(&self, process: &GatewayProcess) {
        let pid = process.pid;
        if let Err(e) = self.host.terminate(pid).await {
            warn!("Failed to terminate gateway process {pid}: {e:#}");
        }
        tokio::time::sleep(self.opts.grace_period).await;

        if self.host.is_alive(pid).await {
            warn!("Gateway process {pid} survived the grace period, killing it");
            if let Err(e) = self.host.kill(pid).await {
                warn!("Failed to kill gateway process {pid}: {e:#}");
            }
            tokio::time::sleep(FORCE_KILL_WAIT).await;
        }

        self.set_state(pid, GatewayState::Killed).await;
        self.clear_registry(pid).await;
    }

    async fn set_state(&self, pid: u32, next: GatewayState) {
        let mut registry = self.registry.lock().await;
        if let Some(process) = registry.as_mut().filter(|p| p.pid == pid) {
            if process.state != next {
                if !process.state.can_transition_to(next) {
                    debug!("Unexpected gateway transition {} -> {}", process.state, next);
                }
                process.state = next;
            }
        }
    }

    async fn clear_registry(&self, pid: u32) {
        let mut registry = self.registry.lock().await;
        if registry.as_ref().is_some_and(|p| p.pid == pid) {
            *registry = None;
        }
    }
}

/// Check a restart token against the configured gateway token.
fn authorize(config: &GatewayConfig, token: Option<&str>) -> WardenResult<()> {
    let Some(expected) = config.auth_token() else {
        warn!("Restart rejected: no gateway token is configured");
        return Err(WardenError::Unauthorized);
    };
    match token {
        Some(given) if secure_eq(given, expected) => Ok(()),
        _ => {
            warn!("Restart rejected: bad token");
            Err(WardenError::Unauthorized)
        }
    }
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Success means something accepted a TCP connection on the port in time.
pub async fn probe_port(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
