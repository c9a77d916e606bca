//! Companion transport: connection ownership, call execution, failure
//! classification, and bounded-backoff reconnection.
//!
//! All connect/disconnect/reconnect sequences run under one async mutex per
//! transport. Peer death is detected either by the channel's reader task or by
//! classifying a failed call; the first report for a given connection tears it
//! down, fails every pending call with PeerDied, and starts the reconnect loop.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backoff::Backoff;
use super::channel::{ChannelFault, Connector, IpcChannel};
use super::correlator::RequestCorrelator;
use super::protocol::{remote_codes, Capabilities, Push, Request, Response, PROTOCOL_VERSION};
use crate::error::{AuthError, ConnectionError, LinkError, Result};
use crate::observe::{EventStream, StateStream};
use crate::telemetry::{metrics, CallSpan, SpanExt};

/// Linux errno values that signal a full channel rather than a dead peer.
const ENOMEM: i32 = 12;
const ENOBUFS: i32 = 105;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hard bound on a single channel call, independent of the correlator
    /// deadline.
    pub call_timeout: Duration,
    pub backoff: Backoff,
    /// Protocol version announced in the connect handshake.
    pub client_version: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(35),
            backoff: Backoff::default(),
            client_version: PROTOCOL_VERSION,
        }
    }
}

/// Result of [`Transport::connect`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Connected {
        version: u32,
        capabilities: Capabilities,
    },
    /// The companion endpoint is not discoverable.
    NotRunning,
    Failed(LinkError),
}

/// Observable link state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected {
        version: u32,
        capabilities: Capabilities,
        pid: Option<u32>,
    },
    Reconnecting {
        attempt: u32,
    },
    /// Reconnect budget spent; only an explicit connect resumes.
    Exhausted {
        attempts: u32,
    },
}

/// Discrete transport events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerDied,
    Reconnected {
        version: u32,
        capabilities: Capabilities,
    },
    Exhausted {
        attempts: u32,
    },
}

type TeardownHook = Box<dyn Fn() + Send + Sync>;

struct Connection {
    channel: Arc<dyn IpcChannel>,
    serial: u64,
    token: CancellationToken,
}

/// Owner of the companion connection.
pub struct Transport {
    self_ref: Weak<Transport>,
    connector: Arc<dyn Connector>,
    correlator: Arc<RequestCorrelator>,
    config: TransportConfig,
    conn_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Connection>>,
    serial: AtomicU64,
    status: StateStream<LinkStatus>,
    events: EventStream<TransportEvent>,
    pushes: EventStream<Push>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
    reconnecting: AtomicBool,
    exhausted: AtomicBool,
    reconnect_token: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        correlator: Arc<RequestCorrelator>,
        config: TransportConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            connector,
            correlator,
            config,
            conn_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            serial: AtomicU64::new(0),
            status: StateStream::new(LinkStatus::Disconnected),
            events: EventStream::default(),
            pushes: EventStream::default(),
            teardown_hooks: Mutex::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            reconnect_token: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Connect to the companion. Resets an exhausted reconnect budget.
    pub async fn connect(&self) -> ConnectOutcome {
        if self.shutdown.is_cancelled() {
            return ConnectOutcome::Failed(LinkError::Closed);
        }
        let _guard = self.conn_lock.lock().await;
        self.exhausted.store(false, Ordering::Release);
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> ConnectOutcome {
        if let Some(channel) = self.live_channel() {
            if let LinkStatus::Connected { version, capabilities, .. } = self.status.get() {
                if channel.is_alive() {
                    return ConnectOutcome::Connected { version, capabilities };
                }
            }
        }

        if !self.connector.is_discoverable().await {
            tracing::debug!("companion endpoint not discoverable");
            self.set_idle_status();
            return ConnectOutcome::NotRunning;
        }

        self.status.set(LinkStatus::Connecting);
        let channel = match self.connector.open(Arc::clone(&self.correlator)).await {
            Ok(channel) => channel,
            Err(ChannelFault::NotFound) => {
                self.set_idle_status();
                return ConnectOutcome::NotRunning;
            }
            Err(fault) => {
                self.set_idle_status();
                return ConnectOutcome::Failed(plain_classification(fault));
            }
        };

        let handshake = tokio::time::timeout(
            self.config.call_timeout,
            channel.call(
                Request::Connect {
                    client_version: self.config.client_version,
                },
                self.config.call_timeout,
            ),
        )
        .await;

        let (version, capabilities, pid) = match handshake {
            Ok(Ok(Response::Connected {
                version,
                capabilities,
                pid,
            })) => (version, capabilities, pid),
            Ok(Ok(Response::Error { code, message })) => {
                channel.close().await;
                self.set_idle_status();
                return ConnectOutcome::Failed(remote_error(code, message));
            }
            Ok(Ok(other)) => {
                channel.close().await;
                self.set_idle_status();
                return ConnectOutcome::Failed(LinkError::Protocol(format!(
                    "unexpected connect reply: {other:?}"
                )));
            }
            Ok(Err(fault)) => {
                channel.close().await;
                self.set_idle_status();
                return ConnectOutcome::Failed(plain_classification(fault));
            }
            Err(_) => {
                channel.close().await;
                self.set_idle_status();
                let timeout = self.config.call_timeout;
                return ConnectOutcome::Failed(ConnectionError::Timeout(timeout).into());
            }
        };

        self.install(channel);
        self.status.set(LinkStatus::Connected { version, capabilities, pid });
        tracing::info!(version, capabilities = capabilities.bits(), ?pid, "connected to companion");
        ConnectOutcome::Connected { version, capabilities }
    }

    /// Store a fresh connection and start its watcher and push forwarder.
    fn install(&self, channel: Arc<dyn IpcChannel>) {
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        let token = self.shutdown.child_token();

        let previous = self.current.lock().replace(Connection {
            channel: Arc::clone(&channel),
            serial,
            token: token.clone(),
        });
        if let Some(old) = previous {
            old.token.cancel();
            tokio::spawn(async move { old.channel.close().await });
        }

        let weak = self.self_ref.clone();
        let watched = Arc::clone(&channel);
        let watch_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = watch_token.cancelled() => {}
                () = watched.closed() => {
                    if let Some(this) = weak.upgrade() {
                        this.handle_peer_death(serial);
                    }
                }
            }
        });

        let mut rx = channel.pushes();
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                let push = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    push = rx.recv() => push,
                };
                match push {
                    Ok(push) => match weak.upgrade() {
                        Some(this) => this.pushes.publish(push),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "push forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn set_idle_status(&self) {
        if !self.reconnecting.load(Ordering::Acquire) {
            self.status.set(LinkStatus::Disconnected);
        }
    }

    fn live_channel(&self) -> Option<Arc<dyn IpcChannel>> {
        self.current
            .lock()
            .as_ref()
            .filter(|c| c.channel.is_alive())
            .map(|c| Arc::clone(&c.channel))
    }

    fn current_connection(&self) -> Option<(Arc<dyn IpcChannel>, u64)> {
        self.current
            .lock()
            .as_ref()
            .map(|c| (Arc::clone(&c.channel), c.serial))
    }

    /// Whether the companion endpoint can currently be found.
    pub async fn is_discoverable(&self) -> bool {
        self.connector.is_discoverable().await
    }

    pub fn is_connected(&self) -> bool {
        self.live_channel().is_some()
    }

    /// Close the connection and stop any reconnect loop.
    pub async fn disconnect(&self) {
        self.stop_reconnect();
        let _guard = self.conn_lock.lock().await;
        self.teardown(ConnectionError::NotConnected.into()).await;
        self.status.set(LinkStatus::Disconnected);
        tracing::info!("disconnected from companion");
    }

    /// Permanently shut the transport down.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.stop_reconnect();
        let _guard = self.conn_lock.lock().await;
        self.teardown(LinkError::Closed).await;
        self.status.set(LinkStatus::Disconnected);
    }

    async fn teardown(&self, error: LinkError) {
        let taken = self.current.lock().take();
        if let Some(conn) = taken {
            conn.token.cancel();
            conn.channel.close().await;
            self.run_teardown_hooks();
        }
        self.correlator.cancel_all(error);
    }

    fn stop_reconnect(&self) {
        self.reconnect_token.lock().cancel();
    }

    /// Register a hook run synchronously whenever a connection is torn down.
    pub fn add_teardown_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.teardown_hooks.lock().push(Box::new(hook));
    }

    fn run_teardown_hooks(&self) {
        for hook in self.teardown_hooks.lock().iter() {
            hook();
        }
    }

    /// Execute one call over the live connection.
    ///
    /// The call is bounded by the correlator's request timeout and, outside
    /// that, by the transport's hard call timeout. The correlator deadline
    /// never exceeds the hard timeout, so it fires first and its pending
    /// entry and timeout event are settled before the outer bound can drop
    /// the call. Every failure is classified; a PeerDied classification tears
    /// the connection down.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (channel, serial) = self
            .current_connection()
            .filter(|(c, _)| c.is_alive())
            .ok_or(ConnectionError::NotConnected)?;

        let method = request.method();
        metrics::record_call_issued(method);
        let span = CallSpan::new(method);

        let call_timeout = self.config.call_timeout;
        let request_timeout = self.correlator.config().request_timeout.min(call_timeout);
        let outcome = tokio::time::timeout(call_timeout, channel.call(request, request_timeout))
            .instrument(span.clone())
            .await;

        let result = match outcome {
            Err(_) => Err(ConnectionError::Timeout(call_timeout).into()),
            Ok(Ok(Response::Error { code, message })) => {
                Err(self.classify_remote(&channel, code, message).await)
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(fault)) => Err(self.classify_fault(&channel, fault).await),
        };
        span.record_result(&result);

        if let Err(e) = &result {
            if e.is_peer_died() {
                self.handle_peer_death(serial);
            } else {
                tracing::debug!(method, error = %e, "companion call failed");
            }
        }
        result
    }

    /// Map a raw channel fault onto the connection taxonomy. Ambiguous
    /// resource faults are settled by an independent liveness probe.
    async fn classify_fault(
        &self,
        channel: &Arc<dyn IpcChannel>,
        fault: ChannelFault,
    ) -> LinkError {
        if self.shutdown.is_cancelled() {
            return LinkError::Closed;
        }
        match fault {
            ChannelFault::Io { kind, os_code, .. } if is_resource_exhaustion(kind, os_code) => {
                self.probe_exhaustion(channel).await
            }
            other => plain_classification(other),
        }
    }

    async fn classify_remote(
        &self,
        channel: &Arc<dyn IpcChannel>,
        code: i32,
        message: String,
    ) -> LinkError {
        if code == remote_codes::RESOURCE_EXHAUSTED {
            return self.probe_exhaustion(channel).await;
        }
        remote_error(code, message)
    }

    async fn probe_exhaustion(&self, channel: &Arc<dyn IpcChannel>) -> LinkError {
        if channel.probe().await {
            ConnectionError::ResourceExhausted.into()
        } else {
            ConnectionError::PeerDied.into()
        }
    }

    /// Tear down connection `serial` after peer death. Later reports for the
    /// same connection are ignored.
    fn handle_peer_death(&self, serial: u64) {
        let conn = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(c) if c.serial == serial => current.take(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return;
        };

        tracing::warn!(serial, "companion peer died; tearing down connection");
        conn.token.cancel();
        tokio::spawn(async move { conn.channel.close().await });
        self.run_teardown_hooks();
        self.correlator.cancel_all(ConnectionError::PeerDied.into());
        self.events.publish(TransportEvent::PeerDied);

        if self.shutdown.is_cancelled() {
            self.status.set(LinkStatus::Disconnected);
            return;
        }
        if self.exhausted.load(Ordering::Acquire) {
            tracing::debug!("reconnect budget already exhausted; not retrying");
            return;
        }
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let token = self.shutdown.child_token();
        *self.reconnect_token.lock() = token.clone();

        let Some(this) = self.self_ref.upgrade() else {
            self.reconnecting.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            this.reconnect_loop(&token).await;
            this.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self, token: &CancellationToken) {
        let backoff = self.config.backoff;
        let mut failures = 0u32;

        loop {
            if !backoff.allows(failures) {
                self.exhausted.store(true, Ordering::Release);
                self.status.set(LinkStatus::Exhausted { attempts: failures });
                self.events.publish(TransportEvent::Exhausted { attempts: failures });
                tracing::error!(attempts = failures, "reconnect attempts exhausted");
                return;
            }

            self.status.set(LinkStatus::Reconnecting { attempt: failures + 1 });
            let delay = backoff.delay_for_attempt(failures);
            tracing::info!(attempt = failures + 1, ?delay, "reconnecting to companion");

            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            metrics::record_reconnect_attempt();
            let outcome = {
                let _guard = self.conn_lock.lock().await;
                if token.is_cancelled() {
                    return;
                }
                self.connect_locked().await
            };

            match outcome {
                ConnectOutcome::Connected { version, capabilities } => {
                    tracing::info!(attempts = failures + 1, "reconnected to companion");
                    self.events.publish(TransportEvent::Reconnected { version, capabilities });
                    return;
                }
                ConnectOutcome::NotRunning => {
                    tracing::warn!(attempt = failures + 1, "companion not running");
                }
                ConnectOutcome::Failed(e) => {
                    tracing::warn!(attempt = failures + 1, error = %e, "reconnect attempt failed");
                }
            }
            failures += 1;
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LinkStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Companion pushes, stable across reconnects.
    pub fn pushes(&self) -> broadcast::Receiver<Push> {
        self.pushes.subscribe()
    }
}

/// Executes one companion call. Implemented by [`Transport`]; higher layers
/// depend on this seam so they can run against a scripted companion.
#[async_trait]
pub trait RpcExecutor: Send + Sync {
    async fn execute(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl RpcExecutor for Transport {
    async fn execute(&self, request: Request) -> Result<Response> {
        Transport::execute(self, request).await
    }
}

/// Classification that needs no liveness probe.
fn plain_classification(fault: ChannelFault) -> LinkError {
    if fault.is_disconnect() {
        return match fault {
            ChannelFault::NotFound => ConnectionError::ServiceNotFound.into(),
            _ => ConnectionError::PeerDied.into(),
        };
    }
    match fault {
        ChannelFault::TimedOut(d) => ConnectionError::Timeout(d).into(),
        ChannelFault::Io {
            kind: io::ErrorKind::PermissionDenied,
            ..
        } => ConnectionError::PermissionDenied.into(),
        ChannelFault::Io { kind, os_code, .. } if is_resource_exhaustion(kind, os_code) => {
            ConnectionError::ResourceExhausted.into()
        }
        ChannelFault::Io { message, .. } => ConnectionError::Unknown(message).into(),
        ChannelFault::Protocol(message) => LinkError::Protocol(message),
        ChannelFault::NotFound | ChannelFault::Closed | ChannelFault::Shutdown => {
            ConnectionError::PeerDied.into()
        }
    }
}

fn is_resource_exhaustion(kind: io::ErrorKind, os_code: Option<i32>) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory)
        || matches!(os_code, Some(ENOBUFS) | Some(ENOMEM))
}

fn remote_error(code: i32, message: String) -> LinkError {
    match code {
        remote_codes::UNAUTHORIZED => LinkError::Unauthorized(message),
        remote_codes::SESSION_EXPIRED => AuthError::SessionExpired.into(),
        remote_codes::RESOURCE_EXHAUSTED => ConnectionError::ResourceExhausted.into(),
        _ => LinkError::Remote { code, message },
    }
}
