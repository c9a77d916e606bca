//! OS-level lifecycle of the companion process.
//!
//! Independent of the session: the companion can be Running while no session
//! exists. Start and stop are serialized; each start phase appends a
//! timestamped line to the log carried by the Starting state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::binary::BinaryDeployer;
use super::runner::{
    denial_error, shell_quote, CommandOutcome, PrivilegedRunner, RootAvailability,
};
use crate::audit::{AuditEventType, AuditLog};
use crate::error::{ConnectionError, DeploymentError, LinkError, Result};
use crate::ipc::{ConnectOutcome, LinkStatus, Transport, PROTOCOL_VERSION};
use crate::observe::StateStream;

/// Log lines copied into a failure diagnostic.
const DIAGNOSTIC_TAIL: usize = 5;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub expected_version: u32,
    /// Process name for signal delivery when the pid is unknown.
    pub daemon_name: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub command_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expected_version: PROTOCOL_VERSION,
            daemon_name: "rootlinkd".to_string(),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(2),
            command_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    Initializing,
    CheckingRoot,
    CheckingBinary,
    Deploying,
    ExecutingStart,
    WaitingForService,
    VerifyingVersion,
    Connecting,
}

impl std::fmt::Display for StartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::CheckingRoot => "checking root",
            Self::CheckingBinary => "checking binary",
            Self::Deploying => "deploying",
            Self::ExecutingStart => "executing start",
            Self::WaitingForService => "waiting for service",
            Self::VerifyingVersion => "verifying version",
            Self::Connecting => "connecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessLifecycleState {
    Stopped,
    Starting {
        phase: StartPhase,
        logs: Vec<String>,
        elapsed_ms: u64,
    },
    Running {
        pid: Option<u32>,
    },
    Stopping,
    Failed {
        reason: String,
        diagnostic: String,
        cause: LinkError,
    },
}

struct StartLog {
    started: Instant,
    lines: Vec<String>,
}

impl StartLog {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            lines: Vec::new(),
        }
    }
}

pub struct ProcessLifecycle {
    self_ref: Weak<ProcessLifecycle>,
    runner: Arc<dyn PrivilegedRunner>,
    binary: BinaryDeployer,
    transport: Arc<Transport>,
    audit: Arc<AuditLog>,
    config: LifecycleConfig,
    state: StateStream<ProcessLifecycleState>,
    op_lock: tokio::sync::Mutex<()>,
    keep_alive: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl ProcessLifecycle {
    pub fn new(
        runner: Arc<dyn PrivilegedRunner>,
        binary: BinaryDeployer,
        transport: Arc<Transport>,
        audit: Arc<AuditLog>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            runner,
            binary,
            transport,
            audit,
            config,
            state: StateStream::new(ProcessLifecycleState::Stopped),
            op_lock: tokio::sync::Mutex::new(()),
            keep_alive: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ProcessLifecycleState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessLifecycleState> {
        self.state.subscribe()
    }

    fn enter(&self, log: &mut StartLog, phase: StartPhase, note: impl AsRef<str>) {
        let line = format!(
            "{} [{phase}] {}",
            Utc::now().format("%H:%M:%S%.3f"),
            note.as_ref()
        );
        tracing::debug!(%phase, note = note.as_ref(), "companion start phase");
        log.lines.push(line);
        self.state.set(ProcessLifecycleState::Starting {
            phase,
            logs: log.lines.clone(),
            elapsed_ms: log.started.elapsed().as_millis() as u64,
        });
    }

    /// Make sure the companion is running and speaks the expected protocol.
    ///
    /// An already-discoverable companion is only version-checked. A version
    /// mismatch triggers one stop, forced redeploy, restart and re-check; a
    /// second mismatch fails with a VersionMismatch diagnostic.
    pub async fn start_daemon(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if let ProcessLifecycleState::Running { .. } = self.state.get() {
            if self.transport.is_connected() {
                return Ok(());
            }
        }

        let mut log = StartLog::new();
        match self.start_sequence(&mut log).await {
            Ok(pid) => {
                self.enter(&mut log, StartPhase::Connecting, "companion ready");
                self.state.set(ProcessLifecycleState::Running { pid });
                self.audit.log(
                    AuditEventType::DaemonStarted,
                    format!("pid={}", pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())),
                );
                let elapsed_ms = log.started.elapsed().as_millis() as u64;
                tracing::info!(?pid, elapsed_ms, "companion running");
                Ok(())
            }
            Err(e) => {
                self.fail(&e, &log);
                Err(e)
            }
        }
    }

    async fn start_sequence(&self, log: &mut StartLog) -> Result<Option<u32>> {
        self.enter(log, StartPhase::Initializing, "starting companion");

        if self.transport.is_discoverable().await {
            self.enter(log, StartPhase::VerifyingVersion, "service already discoverable");
            match self.connect_and_verify(log).await {
                Ok(pid) => return Ok(pid),
                Err(LinkError::Deployment(DeploymentError::VersionMismatch { .. })) => {
                    return self.redeploy_after_mismatch(log).await;
                }
                Err(LinkError::Connection(ConnectionError::ServiceNotFound)) => {
                    self.enter(log, StartPhase::Initializing, "stale endpoint; launching");
                }
                Err(e) => return Err(e),
            }
        }

        self.check_root(log).await?;

        self.enter(log, StartPhase::CheckingBinary, "comparing installed binary");
        let current = self.binary.verify().await?;
        let installed_version = if current {
            self.binary.installed_version().await
        } else {
            None
        };
        if !current || installed_version.is_some_and(|v| v != self.config.expected_version) {
            self.enter(log, StartPhase::Deploying, "installing bundled binary");
            self.binary.deploy(true).await?;
        }

        self.launch(log).await?;
        match self.connect_and_verify(log).await {
            Err(LinkError::Deployment(DeploymentError::VersionMismatch { .. })) => {
                self.redeploy_after_mismatch(log).await
            }
            other => other,
        }
    }

    async fn check_root(&self, log: &mut StartLog) -> Result<()> {
        self.enter(log, StartPhase::CheckingRoot, "probing elevated access");
        match self.runner.availability().await {
            RootAvailability::Available => Ok(()),
            RootAvailability::Unavailable(reason) => {
                Err(DeploymentError::RootUnavailable(reason).into())
            }
            RootAvailability::PolicyDenied(reason) => {
                Err(DeploymentError::PolicyDenied(reason).into())
            }
        }
    }

    async fn launch(&self, log: &mut StartLog) -> Result<()> {
        self.enter(log, StartPhase::ExecutingStart, "invoking start command");
        let command = format!(
            "{} --daemon",
            shell_quote(&self.binary.installed_path().to_string_lossy())
        );
        match self.runner.execute(&command, self.config.command_timeout).await {
            CommandOutcome::Success { .. } => {}
            CommandOutcome::AccessDenied { reason } => {
                return Err(DeploymentError::PermissionError(reason).into());
            }
            CommandOutcome::Error { message, stderr } => {
                let detail = format!("{message}: {}", stderr.trim());
                return Err(DeploymentError::ProcessCrashed(detail).into());
            }
            CommandOutcome::Timeout => {
                return Err(DeploymentError::StartupTimeout(self.config.command_timeout).into());
            }
        }

        self.enter(log, StartPhase::WaitingForService, "polling for service");
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if self.transport.is_discoverable().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeploymentError::StartupTimeout(self.config.startup_timeout).into());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn connect_and_verify(&self, log: &mut StartLog) -> Result<Option<u32>> {
        self.enter(log, StartPhase::VerifyingVersion, "connecting for version handshake");
        match self.transport.connect().await {
            ConnectOutcome::Connected { version, .. } => {
                let expected = self.config.expected_version;
                if version != expected {
                    self.enter(
                        log,
                        StartPhase::VerifyingVersion,
                        format!("companion speaks protocol {version}, expected {expected}"),
                    );
                    return Err(DeploymentError::VersionMismatch {
                        expected,
                        actual: version,
                    }
                    .into());
                }
                let pid = match self.transport.status() {
                    LinkStatus::Connected { pid, .. } => pid,
                    _ => None,
                };
                Ok(pid)
            }
            ConnectOutcome::NotRunning => Err(ConnectionError::ServiceNotFound.into()),
            ConnectOutcome::Failed(e) => Err(e),
        }
    }

    async fn redeploy_after_mismatch(&self, log: &mut StartLog) -> Result<Option<u32>> {
        self.audit.log(AuditEventType::VersionMismatch, "redeploying companion");
        self.enter(log, StartPhase::Deploying, "version mismatch; stopping old companion");
        self.transport.disconnect().await;
        self.stop_process(None).await?;

        self.check_root(log).await?;
        self.enter(log, StartPhase::Deploying, "force-redeploying binary");
        self.binary.deploy(true).await?;
        self.launch(log).await?;

        let result = self.connect_and_verify(log).await;
        if let Err(LinkError::Deployment(DeploymentError::VersionMismatch { .. })) = &result {
            self.transport.disconnect().await;
        }
        result
    }

    fn fail(&self, error: &LinkError, log: &StartLog) {
        let mut diagnostic = diagnose(error);
        let tail = log.lines.len().saturating_sub(DIAGNOSTIC_TAIL);
        for line in &log.lines[tail..] {
            diagnostic.push('\n');
            diagnostic.push_str(line);
        }
        tracing::error!(error = %error, "companion start failed");
        self.state.set(ProcessLifecycleState::Failed {
            reason: error.to_string(),
            diagnostic,
            cause: error.clone(),
        });
    }

    /// Terminate gracefully, escalating to SIGKILL after the grace period.
    ///
    /// A companion that cannot be signalled, or that outlives SIGKILL,
    /// leaves the lifecycle Failed rather than Stopped.
    pub async fn stop_daemon(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.cancel_keep_alive();
        let pid = match self.state.get() {
            ProcessLifecycleState::Running { pid } => pid,
            _ => None,
        };

        self.state.set(ProcessLifecycleState::Stopping);
        self.transport.disconnect().await;
        if let Err(e) = self.stop_process(pid).await {
            tracing::error!(error = %e, "companion stop failed");
            self.audit.log(AuditEventType::DaemonStopFailed, e.to_string());
            self.state.set(ProcessLifecycleState::Failed {
                reason: e.to_string(),
                diagnostic: diagnose(&e),
                cause: e.clone(),
            });
            return Err(e);
        }
        self.state.set(ProcessLifecycleState::Stopped);
        self.audit.log(AuditEventType::DaemonStopped, "companion stopped");
        tracing::info!("companion stopped");
        Ok(())
    }

    async fn stop_process(&self, pid: Option<u32>) -> Result<()> {
        let name = shell_quote(&self.config.daemon_name);
        let (term, kill, check) = match pid {
            Some(pid) => (
                format!("kill -TERM {pid}"),
                format!("kill -KILL {pid}"),
                format!("kill -0 {pid}"),
            ),
            None => (
                format!("pkill -TERM -x {name}"),
                format!("pkill -KILL -x {name}"),
                format!("pgrep -x {name}"),
            ),
        };
        let timeout = self.config.command_timeout;

        if let CommandOutcome::AccessDenied { reason } = self.runner.execute(&term, timeout).await {
            tracing::warn!(%reason, "terminate signal denied");
            return Err(denial_error(reason).into());
        }

        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            if !self.is_alive(&check).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        tracing::warn!("companion ignored SIGTERM; killing");
        match self.runner.execute(&kill, timeout).await {
            CommandOutcome::AccessDenied { reason } => return Err(denial_error(reason).into()),
            CommandOutcome::Timeout => {
                return Err(DeploymentError::StopFailed("SIGKILL timed out".into()).into());
            }
            CommandOutcome::Success { .. } | CommandOutcome::Error { .. } => {}
        }
        tokio::time::sleep(self.config.poll_interval).await;
        if self.is_alive(&check).await? {
            return Err(DeploymentError::StopFailed("still running after SIGKILL".into()).into());
        }
        Ok(())
    }

    /// A refused or timed-out liveness check is an error, never "gone".
    async fn is_alive(&self, check: &str) -> Result<bool> {
        match self.runner.execute(check, self.config.command_timeout).await {
            CommandOutcome::Success { .. } => Ok(true),
            CommandOutcome::Error { .. } => Ok(false),
            CommandOutcome::AccessDenied { reason } => Err(denial_error(reason).into()),
            CommandOutcome::Timeout => {
                Err(DeploymentError::StopFailed("liveness check timed out".into()).into())
            }
        }
    }

    /// Stop the companion after `idle` unless cancelled or re-armed.
    pub fn arm_keep_alive(&self, idle: Duration) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.keep_alive.lock().replace(token.clone()) {
            previous.cancel();
        }
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(idle) => {
                    if let Some(this) = weak.upgrade() {
                        tracing::info!(?idle, "keep-alive expired; stopping companion");
                        let _ = this.stop_daemon().await;
                    }
                }
            }
        });
    }

    pub fn cancel_keep_alive(&self) {
        if let Some(token) = self.keep_alive.lock().take() {
            token.cancel();
        }
    }

    /// Keep this view consistent with companions started or killed outside
    /// this client.
    pub fn watch_transport(&self) -> JoinHandle<()> {
        let mut rx = self.transport.subscribe_status();
        let weak = self.self_ref.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = rx.borrow_and_update().clone();
                        match weak.upgrade() {
                            Some(this) => this.sync_with(&status),
                            None => break,
                        }
                    }
                }
            }
        })
    }

    fn sync_with(&self, status: &LinkStatus) {
        self.state.update(|state| match (status, &*state) {
            (
                LinkStatus::Connected { pid, .. },
                ProcessLifecycleState::Stopped | ProcessLifecycleState::Failed { .. },
            ) => {
                tracing::info!(?pid, "companion found running");
                *state = ProcessLifecycleState::Running { pid: *pid };
                true
            }
            (
                LinkStatus::Connected { pid: Some(pid), .. },
                ProcessLifecycleState::Running { pid: None },
            ) => {
                *state = ProcessLifecycleState::Running { pid: Some(*pid) };
                true
            }
            (LinkStatus::Exhausted { .. }, ProcessLifecycleState::Running { .. }) => {
                tracing::warn!("companion unreachable; marking stopped");
                *state = ProcessLifecycleState::Stopped;
                true
            }
            _ => false,
        });
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.cancel_keep_alive();
    }
}

/// Operator-facing explanation of a start failure.
fn diagnose(error: &LinkError) -> String {
    match error {
        LinkError::Deployment(DeploymentError::RootUnavailable(reason)) => {
            format!("Root access is unavailable ({reason}). Grant superuser access and retry.")
        }
        LinkError::Deployment(DeploymentError::PolicyDenied(reason)) => {
            format!("Root exists but a security policy refused the request ({reason}).")
        }
        LinkError::Deployment(DeploymentError::BinaryMissing(path)) => {
            format!("The bundled companion binary is missing ({path}). Reinstall the client.")
        }
        LinkError::Deployment(DeploymentError::VersionMismatch { expected, actual }) => format!(
            "The companion still speaks protocol {actual} after a forced redeploy; this client needs {expected}."
        ),
        LinkError::Deployment(DeploymentError::StartupTimeout(d)) => {
            format!("The companion did not expose its service within {d:?}.")
        }
        other => other.to_string(),
    }
}
