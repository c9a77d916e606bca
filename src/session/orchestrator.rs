//! Top-level session driver.
//!
//! Establish sequence: companion process, local credentials, transport,
//! existing-session check, authentication, reconciliation, Ready. Transport
//! death re-enters the sequence at the session check once the transport has
//! reconnected on its own.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reconcile::{reconcile, ReconcileStore};
use super::state::{BufferReleaseRequest, ErrorEvent, SessionState};
use crate::audit::{AuditEventType, AuditLog};
use crate::auth::Authenticator;
use crate::buffer::{BufferPool, ManagedBuffer};
use crate::crypto::SecureChannel;
use crate::error::{AuthError, ConnectionError, LinkError, Result};
use crate::ipc::protocol::remote_codes;
use crate::ipc::{
    ConnectOutcome, LinkStatus, Push, Request, Response, SessionBinding, StatusUpdate,
    SystemStatus, Transport, TransportEvent,
};
use crate::lifecycle::ProcessLifecycle;
use crate::observe::{EventStream, StateStream};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect calls within this window share one attempt.
    pub debounce: Duration,
    /// Longest wait for another client's session to expire.
    pub conflict_wait: Duration,
    /// Start the companion process before connecting.
    pub manage_companion: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            conflict_wait: Duration::from_secs(5),
            manage_companion: true,
        }
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

struct ConnectAttempt {
    id: u64,
    started: Instant,
    token: CancellationToken,
    future: ConnectFuture,
}

pub struct SessionOrchestrator {
    self_ref: Weak<SessionOrchestrator>,
    transport: Arc<Transport>,
    lifecycle: Arc<ProcessLifecycle>,
    authenticator: Arc<Authenticator>,
    secure: Arc<SecureChannel>,
    pool: Arc<BufferPool>,
    audit: Arc<AuditLog>,
    reconcile: ReconcileStore,
    config: SessionConfig,
    state: StateStream<SessionState>,
    errors: EventStream<ErrorEvent>,
    status_updates: EventStream<StatusUpdate>,
    release_requests: EventStream<BufferReleaseRequest>,
    attempt: Mutex<Option<ConnectAttempt>>,
    attempt_seq: AtomicU64,
    op_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<Transport>,
        lifecycle: Arc<ProcessLifecycle>,
        authenticator: Arc<Authenticator>,
        secure: Arc<SecureChannel>,
        pool: Arc<BufferPool>,
        audit: Arc<AuditLog>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let this = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            transport,
            lifecycle,
            authenticator,
            secure,
            pool,
            audit,
            reconcile: ReconcileStore::new(),
            config,
            state: StateStream::new(SessionState::Stopped),
            errors: EventStream::default(),
            status_updates: EventStream::default(),
            release_requests: EventStream::default(),
            attempt: Mutex::new(None),
            attempt_seq: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        let pool = Arc::downgrade(&this.pool);
        this.transport.add_teardown_hook(move || {
            let cleared = pool.upgrade().map_or(0, |pool| pool.clear_local());
            if cleared > 0 {
                tracing::debug!(cleared, "dropped buffers of a dead connection");
            }
        });

        let router = this.spawn_push_router();
        let listener = this.spawn_event_listener();
        this.tasks.lock().extend([router, listener]);
        this
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get().is_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    pub fn subscribe_status_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_updates.subscribe()
    }

    pub fn subscribe_release_requests(&self) -> broadcast::Receiver<BufferReleaseRequest> {
        self.release_requests.subscribe()
    }

    pub fn secure_channel(&self) -> &Arc<SecureChannel> {
        &self.secure
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Establish a Ready session.
    ///
    /// Calls within the debounce window share one attempt. A call after the
    /// window cancels an attempt still in flight and starts a new one.
    pub async fn connect(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Closed);
        }
        let future = {
            let mut slot = self.attempt.lock();
            match slot.as_ref() {
                Some(attempt) if attempt.started.elapsed() < self.config.debounce => {
                    tracing::debug!(attempt = attempt.id, "coalescing connect");
                    attempt.future.clone()
                }
                _ => {
                    if let Some(previous) = slot.take() {
                        previous.token.cancel();
                    }
                    let attempt = self.new_attempt();
                    let future = attempt.future.clone();
                    *slot = Some(attempt);
                    future
                }
            }
        };
        future.await
    }

    fn new_attempt(&self) -> ConnectAttempt {
        let id = self.attempt_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.shutdown.child_token();
        let weak = self.self_ref.clone();
        let run_token = token.clone();
        let future = async move {
            match weak.upgrade() {
                Some(this) => this.run_connect(id, run_token).await,
                None => Err(LinkError::Closed),
            }
        }
        .boxed()
        .shared();
        ConnectAttempt {
            id,
            started: Instant::now(),
            token,
            future,
        }
    }

    fn cancel_attempt(&self) {
        if let Some(attempt) = self.attempt.lock().take() {
            attempt.token.cancel();
        }
    }

    async fn run_connect(&self, id: u64, token: CancellationToken) -> Result<()> {
        let _op = tokio::select! {
            biased;
            () = token.cancelled() => return Err(LinkError::Cancelled),
            guard = self.op_lock.lock() => guard,
        };
        if self.is_ready() && self.transport.is_connected() {
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(LinkError::Cancelled),
            result = self.establish() => result,
        };
        match &result {
            Ok(()) => {}
            Err(LinkError::Cancelled) => {
                tracing::debug!(attempt = id, "connect attempt superseded")
            }
            Err(e) => self.fail(e),
        }
        result
    }

    async fn establish(&self) -> Result<()> {
        self.state.set(SessionState::Starting);
        if self.config.manage_companion {
            self.lifecycle.start_daemon().await?;
        }
        self.authenticator.prepare_credentials().await?;

        self.state.set(SessionState::Connecting);
        match self.transport.connect().await {
            ConnectOutcome::Connected { .. } => {}
            ConnectOutcome::NotRunning => return Err(ConnectionError::ServiceNotFound.into()),
            ConnectOutcome::Failed(e) => return Err(e),
        }

        self.authenticate_and_reconcile().await
    }

    /// Session check, authentication unless resuming, reconciliation.
    async fn authenticate_and_reconcile(&self) -> Result<()> {
        let instance_id = self.authenticator.keys().instance_id().await?;
        if self.resolve_existing_session(&instance_id).await? {
            tracing::info!("resuming existing companion session");
            self.audit
                .log(AuditEventType::SessionResumed, format!("instance_id={instance_id}"));
        } else {
            self.state.set(SessionState::Authenticating);
            self.authenticator.authenticate().await?;
        }

        self.state.set(SessionState::Reconciling);
        reconcile(self.transport.as_ref(), &self.reconcile).await?;

        let LinkStatus::Connected {
            version, capabilities, ..
        } = self.transport.status()
        else {
            return Err(ConnectionError::PeerDied.into());
        };
        self.state.set(SessionState::Ready {
            protocol_version: version,
            capabilities,
        });
        tracing::info!(version, capabilities = capabilities.bits(), "session ready");
        Ok(())
    }

    /// True when the companion already holds a session for this client.
    async fn resolve_existing_session(&self, instance_id: &str) -> Result<bool> {
        let binding = match self.check_session(instance_id).await? {
            None => return Ok(false),
            Some(binding) if binding.instance_id == instance_id => return Ok(true),
            Some(binding) => binding,
        };

        let wait = Duration::from_millis(binding.expires_in_ms).min(self.config.conflict_wait);
        tracing::info!(
            holder = %binding.instance_id,
            ?wait,
            "session held by another client; waiting"
        );
        tokio::time::sleep(wait).await;

        match self.check_session(instance_id).await? {
            None => Ok(false),
            Some(binding) if binding.instance_id == instance_id => Ok(true),
            Some(binding) => {
                self.audit.log(
                    AuditEventType::SessionConflict,
                    format!("holder={}", binding.instance_id),
                );
                Err(AuthError::SessionConflict {
                    holder: binding.instance_id,
                }
                .into())
            }
        }
    }

    async fn check_session(&self, instance_id: &str) -> Result<Option<SessionBinding>> {
        let request = Request::CheckSession {
            instance_id: instance_id.to_string(),
        };
        match self.transport.execute(request).await {
            Ok(Response::SessionInfo { session }) => Ok(session),
            Ok(other) => Err(LinkError::Protocol(format!("check_session: unexpected {other:?}"))),
            Err(LinkError::Remote { code, .. }) if code == remote_codes::UNSUPPORTED => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fail(&self, error: &LinkError) {
        tracing::error!(code = error.code(), error = %error, "session failed");
        self.state.set(SessionState::from_error(error));
        self.errors.publish(ErrorEvent::from(error));
    }

    /// Unregister callbacks, tear the transport down, and return to Stopped.
    ///
    /// Remembered configuration is forgotten; a later connect starts clean.
    pub async fn disconnect(&self) {
        self.cancel_attempt();
        let _op = self.op_lock.lock().await;

        if self.transport.is_connected() {
            if let Err(e) = self.transport.execute(Request::UnregisterCallbacks).await {
                tracing::debug!(error = %e, "unregister callbacks failed");
            }
        }
        self.secure.reset().await;
        self.transport.disconnect().await;
        self.reconcile.clear();
        self.state.set(SessionState::Stopped);
        self.audit.log(AuditEventType::SessionDestroyed, "client disconnect");
        tracing::info!("session stopped");
    }

    /// Run `op` on a Ready session.
    ///
    /// PeerDied triggers one full reconnect and a single retry; a transient
    /// Timeout or ResourceExhausted is retried once in place. Any other
    /// failure, and any failure of the retry, is returned unchanged.
    /// Security-relevant failures of `op` are audited.
    pub async fn execute_with_reconnect<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_ready() || !self.transport.is_connected() {
            self.connect().await?;
        }

        let result = match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_peer_died() => {
                tracing::warn!("companion died during call; reconnecting once");
                self.reconnect_now().await?;
                op().await
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "transient failure; retrying once");
                op().await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_security_relevant() {
                self.audit.log(
                    AuditEventType::OperationRejected,
                    format!("code={} {e}", e.code()),
                );
            }
        }
        result
    }

    async fn reconnect_now(&self) -> Result<()> {
        self.cancel_attempt();
        self.transport.disconnect().await;
        self.connect().await
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.execute_with_reconnect(|| self.transport.execute(request.clone()))
            .await
    }

    async fn call_ack(&self, request: Request) -> Result<()> {
        let method = request.method();
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(method, other)),
        }
    }

    /// Apply a configuration and remember it for reconciliation.
    pub async fn configure(&self, config: Value) -> Result<()> {
        self.call_ack(Request::Configure {
            config: config.clone(),
        })
        .await?;
        self.reconcile.remember_config(config);
        Ok(())
    }

    /// Apply hot-path rules and remember them for reconciliation.
    pub async fn configure_hot_path(&self, rules: Value) -> Result<()> {
        self.call_ack(Request::ConfigureHotPath {
            rules: rules.clone(),
        })
        .await?;
        self.reconcile.remember_hot_path(rules);
        Ok(())
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        match self.call(Request::GetSystemStatus).await? {
            Response::SystemStatus { status } => Ok(status),
            other => Err(unexpected("get_system_status", other)),
        }
    }

    pub async fn get_screenshot(&self) -> Result<ManagedBuffer> {
        match self.call(Request::GetScreenshot).await? {
            Response::Buffer { buffer } => Ok(self.pool.acquire_buffer(buffer).await),
            other => Err(unexpected("get_screenshot", other)),
        }
    }

    pub async fn request_perception(&self, params: Value) -> Result<ManagedBuffer> {
        match self.call(Request::RequestPerception { params }).await? {
            Response::Buffer { buffer } => Ok(self.pool.acquire_buffer(buffer).await),
            other => Err(unexpected("request_perception", other)),
        }
    }

    /// Give a buffer back. Returns false if it was not held.
    pub async fn release_screenshot(&self, buffer_id: u64) -> Result<bool> {
        self.pool.release_buffer(buffer_id).await
    }

    fn spawn_push_router(&self) -> JoinHandle<()> {
        let mut pushes = self.transport.pushes();
        let weak = self.self_ref.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let push = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    push = pushes.recv() => push,
                };
                let push = match push {
                    Ok(push) => push,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "push router lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else { break };
                match push {
                    Push::Status { update } => this.status_updates.publish(update),
                    Push::BufferReleaseRequest { buffer_id, timeout_ms } => {
                        this.release_requests
                            .publish(BufferReleaseRequest { buffer_id, timeout_ms });
                        this.pool.handle_memory_pressure(buffer_id, timeout_ms).await;
                    }
                }
            }
        })
    }

    fn spawn_event_listener(&self) -> JoinHandle<()> {
        let mut events = self.transport.subscribe_events();
        let weak = self.self_ref.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "transport event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else { break };
                this.on_transport_event(event).await;
            }
        })
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDied => {
                self.audit.log(AuditEventType::PeerDied, "companion connection lost");
                self.secure.reset().await;
                self.state.update(|state| {
                    if state.is_ready() || state.is_transitional() {
                        *state = SessionState::Connecting;
                        true
                    } else {
                        false
                    }
                });
            }
            TransportEvent::Reconnected { version, .. } => {
                tracing::info!(version, "transport reconnected; re-establishing session");
                self.resume_after_reconnect().await;
            }
            TransportEvent::Exhausted { attempts } => {
                let _op = self.op_lock.lock().await;
                if self.state.get() != SessionState::Stopped {
                    self.fail(&ConnectionError::ReconnectionExhausted { attempts }.into());
                }
            }
        }
    }

    async fn resume_after_reconnect(&self) {
        let _op = self.op_lock.lock().await;
        let state = self.state.get();
        if state == SessionState::Stopped || !self.transport.is_connected() {
            return;
        }
        if state.is_ready() {
            return;
        }
        if let Err(e) = self.authenticate_and_reconcile().await {
            self.fail(&e);
        }
    }

    /// Stop background tasks and any connect attempt.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.cancel_attempt();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn unexpected(method: &str, response: Response) -> LinkError {
    LinkError::Protocol(format!("{method}: unexpected reply {response:?}"))
}
