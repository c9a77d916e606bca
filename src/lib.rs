//! rootlink client runtime
//!
//! Client side of an authenticated, encrypted session with a privileged
//! companion daemon that runs as root on the same device.
//!
//! # Layers
//!
//! - **ipc**: wire protocol, request correlation, transport with reconnect
//! - **auth**: client identity, key provisioning, challenge-response
//! - **crypto**: dual-channel secure session with key rotation
//! - **lifecycle**: companion start/stop, binary deployment
//! - **buffer**: shared zero-copy buffers and memory pressure
//! - **session**: the orchestrator that ties the layers together
//! - **audit**: rate-limited, rotated security audit trail
//!
//! # Security Boundaries
//!
//! - Keys: private key on disk with mode 0600; never logged or audited
//! - Channel: AES-256-GCM per channel, keys bound to an X25519 agreement
//! - IPC: local socket only. No HTTP/REST/WebSocket.

pub mod audit;
pub mod auth;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod observe;
pub mod session;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use audit::AuditLog;
use auth::{AttestationProvider, Authenticator, KeyDeployer, KeyStore, NoAttestation};
use buffer::{BufferPool, PressureController};
use config::LinkConfig;
use crypto::SecureChannel;
use ipc::{Connector, LocalSocketConnector, RequestCorrelator, Transport};
use lifecycle::{BinaryDeployer, BinarySource, PrivilegedRunner, ProcessLifecycle, SuRunner};
use session::{SessionOrchestrator, SessionState};

pub use error::{LinkError, Result};

/// The rootlink runtime: every component, wired together.
pub struct LinkRuntime {
    pub config: LinkConfig,
    pub audit: Arc<AuditLog>,
    pub correlator: Arc<RequestCorrelator>,
    pub transport: Arc<Transport>,
    pub keys: Arc<KeyStore>,
    pub key_deployer: Arc<KeyDeployer>,
    pub authenticator: Arc<Authenticator>,
    pub secure_channel: Arc<SecureChannel>,
    pub lifecycle: Arc<ProcessLifecycle>,
    pub pool: Arc<BufferPool>,
    pub pressure: Arc<PressureController>,
    pub session: Arc<SessionOrchestrator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkRuntime {
    /// Production wiring: local socket, `su`, no attestation provider.
    /// Must be called inside a tokio runtime.
    pub fn new(config: LinkConfig) -> Self {
        let connector = Arc::new(LocalSocketConnector::new(config.socket_path.clone()));
        let runner = Arc::new(SuRunner::new(config.su_path.clone()));
        Self::with_parts(config, connector, runner, Arc::new(NoAttestation))
    }

    /// Wire the runtime around the given IPC, privilege, and attestation
    /// seams.
    pub fn with_parts(
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn PrivilegedRunner>,
        attestation: Arc<dyn AttestationProvider>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let audit = Arc::new(AuditLog::new(config.audit.clone()));

        let correlator = Arc::new(RequestCorrelator::new(config.correlator.clone()));
        let transport =
            Transport::new(connector, Arc::clone(&correlator), config.transport.clone());

        let keys = Arc::new(KeyStore::new(config.state_dir.clone()));
        let key_deployer = Arc::new(KeyDeployer::new(
            Arc::clone(&runner),
            config.key_paths.clone(),
            config.lifecycle.command_timeout,
            Arc::clone(&audit),
        ));
        let authenticator = Arc::new(Authenticator::new(
            transport.clone(),
            Arc::clone(&keys),
            Arc::clone(&key_deployer),
            attestation,
            Arc::clone(&audit),
            config.auth.clone(),
        ));
        let secure_channel = Arc::new(SecureChannel::new(
            transport.clone(),
            Arc::clone(&audit),
            config.secure_channel.clone(),
        ));

        let binary = BinaryDeployer::new(
            Arc::clone(&runner),
            BinarySource {
                bundled: config.bundled_binary.clone(),
                installed: config.installed_binary.clone(),
            },
            config.lifecycle.command_timeout,
        );
        let lifecycle = ProcessLifecycle::new(
            runner,
            binary,
            Arc::clone(&transport),
            Arc::clone(&audit),
            config.lifecycle.clone(),
        );

        let pool = Arc::new(BufferPool::new(transport.clone(), config.pool.clone()));
        let pressure = Arc::new(PressureController::new(Arc::clone(&pool)));

        let session = SessionOrchestrator::new(
            Arc::clone(&transport),
            Arc::clone(&lifecycle),
            Arc::clone(&authenticator),
            Arc::clone(&secure_channel),
            Arc::clone(&pool),
            Arc::clone(&audit),
            config.session.clone(),
        );

        let mut tasks = vec![
            correlator.spawn_sweeper(),
            authenticator.spawn_cleanup(shutdown.child_token()),
            lifecycle.watch_transport(),
        ];
        if let Some(interval) = config.pressure_interval {
            tasks.push(pressure.spawn_monitor(interval, shutdown.child_token()));
        }
        if let Some(idle) = config.keep_alive {
            tasks.push(spawn_keep_alive(&session, &lifecycle, idle, shutdown.child_token()));
        }

        Self {
            config,
            audit,
            correlator,
            transport,
            keys,
            key_deployer,
            authenticator,
            secure_channel,
            lifecycle,
            pool,
            pressure,
            session,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Disconnect, stop every background task, and fail pending calls with
    /// Closed.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.session.disconnect().await;
        self.session.close();
        self.lifecycle.close();
        self.shutdown.cancel();
        self.transport.close().await;
        self.correlator.close();
        self.audit.close().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("rootlink runtime closed");
    }
}

/// Arm the companion keep-alive whenever the session stops and cancel it as
/// soon as a session is being established again.
fn spawn_keep_alive(
    session: &Arc<SessionOrchestrator>,
    lifecycle: &Arc<ProcessLifecycle>,
    idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut states = session.subscribe();
    let lifecycle = Arc::downgrade(lifecycle);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    let Some(lifecycle) = lifecycle.upgrade() else { break };
                    match state {
                        SessionState::Stopped | SessionState::Error { .. } => {
                            lifecycle.arm_keep_alive(idle)
                        }
                        _ => lifecycle.cancel_keep_alive(),
                    }
                }
            }
        }
    })
}
