//! Scripted in-memory companion shared by the integration tests.
//!
//! The companion speaks the real frame protocol over `tokio::io::duplex`
//! streams, so the production `FramedChannel` and `RequestCorrelator` are in
//! the loop. `FakeRunner` plays the privileged shell: it understands the
//! handful of commands the lifecycle and key deployer issue.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{PublicKey, StaticSecret};

use rootlink::audit::AuditConfig;
use rootlink::auth::{AttestationProvider, AuthenticatorConfig, KeyPaths};
use rootlink::buffer::BufferPoolConfig;
use rootlink::config::LinkConfig;
use rootlink::crypto::{
    derive_channel_keys, derive_channel_secret, ChannelCipher, ChannelKind, Direction,
    EnvelopeHeader, SecureChannelConfig,
};
use rootlink::ipc::protocol::{decode_frame, decode_frame_len, encode_frame, FRAME_HEADER_SIZE};
use rootlink::ipc::{
    Backoff, BufferDescriptor, Capabilities, ChannelFault, Connector, CorrelatorConfig,
    FramedChannel, Frame, IpcChannel, Push, Request, RequestCorrelator, Response, SessionBinding,
    SystemStatus, TransportConfig, PROTOCOL_VERSION,
};
use rootlink::lifecycle::{CommandOutcome, LifecycleConfig, PrivilegedRunner};
use rootlink::session::SessionConfig;
use rootlink::LinkRuntime;

pub const PSK: &[u8] = b"integration-test-preshared-secret";
pub const COMPANION_PID: u32 = 4242;
pub const KEY_PATH: &str = "/data/adb/rootlink/client.pub";
pub const PINNED_PATH: &str = "/data/adb/rootlink/pinned.fp";

/// Server half of the secure channel.
struct ServerCrypto {
    generation: u32,
    control: ChannelCipher,
    data: ChannelCipher,
    control_seq: u64,
    data_seq: u64,
    /// Envelopes previously sent on the data channel, oldest first.
    data_history: Vec<Vec<u8>>,
}

impl ServerCrypto {
    fn derive(client_public: &[u8; 32], generation: u32) -> (Self, [u8; 32]) {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let server_public = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(*client_public));
        let channel_secret = derive_channel_secret(PSK, client_public, &server_public)
            .expect("channel secret");
        let keys = derive_channel_keys(&channel_secret, shared.as_bytes(), generation)
            .expect("channel keys");
        let crypto = Self {
            generation,
            control: ChannelCipher::new(keys.control, ChannelKind::Control),
            data: ChannelCipher::new(keys.data, ChannelKind::Data),
            control_seq: 0,
            data_seq: 0,
            data_history: Vec::new(),
        };
        (crypto, server_public)
    }

    fn echo(&mut self, kind: ChannelKind, envelope: &[u8]) -> Response {
        let cipher = match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Data => &self.data,
        };
        let plaintext = match cipher.open(envelope) {
            Ok((header, plaintext)) if header.direction == Direction::ClientToServer => plaintext,
            _ => {
                return Response::Error {
                    code: 400,
                    message: "undecryptable envelope".into(),
                }
            }
        };
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(&plaintext);

        let seq = match kind {
            ChannelKind::Control => {
                self.control_seq += 1;
                self.control_seq
            }
            ChannelKind::Data => {
                self.data_seq += 1;
                self.data_seq
            }
        };
        let cipher = match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Data => &self.data,
        };
        let sealed = cipher
            .seal(Direction::ServerToClient, self.generation, seq, &reply)
            .expect("seal");
        if kind == ChannelKind::Data {
            self.data_history.push(sealed.clone());
        }
        Response::Envelope { envelope: sealed }
    }
}

struct CompanionState {
    running: bool,
    version: u32,
    capabilities: Capabilities,
    trusted_key: Option<[u8; 32]>,
    auth_disabled: bool,
    repeat_nonce: bool,
    last_nonce: Option<Vec<u8>>,
    attestation_required: bool,
    attestation_accept: bool,
    session: Option<SessionBinding>,
    crypto: Option<ServerCrypto>,
    replay_next_data: bool,
    next_buffer: u64,
    hang: Vec<&'static str>,
    scripted: HashMap<&'static str, VecDeque<Response>>,
    calls: Vec<Request>,
    connects: u32,
}

struct ConnHandle {
    kill: CancellationToken,
    pushes: mpsc::UnboundedSender<Frame>,
}

/// The scripted companion daemon.
pub struct Companion {
    state: Mutex<CompanionState>,
    conns: Mutex<Vec<ConnHandle>>,
}

impl Companion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompanionState {
                running: false,
                version: PROTOCOL_VERSION,
                capabilities: Capabilities::SCREENSHOT
                    .union(Capabilities::SECURE_CHANNEL)
                    .union(Capabilities::PERCEPTION),
                trusted_key: None,
                auth_disabled: false,
                repeat_nonce: false,
                last_nonce: None,
                attestation_required: false,
                attestation_accept: true,
                session: None,
                crypto: None,
                replay_next_data: false,
                next_buffer: 1,
                hang: Vec::new(),
                scripted: HashMap::new(),
                calls: Vec::new(),
                connects: 0,
            }),
            conns: Mutex::new(Vec::new()),
        })
    }

    /// A companion that is already running and speaks `version`.
    pub fn running(version: u32) -> Arc<Self> {
        let companion = Self::new();
        companion.launch(version);
        companion
    }

    pub fn launch(&self, version: u32) {
        let mut state = self.state.lock();
        state.running = true;
        state.version = version;
    }

    /// Stop the process: drop every connection and forget sessions.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            state.session = None;
            state.crypto = None;
        }
        self.drop_connections();
    }

    /// Drop every live connection while staying discoverable, as if the
    /// companion restarted instantly.
    pub fn crash(&self) {
        self.state.lock().crypto = None;
        self.drop_connections();
    }

    fn drop_connections(&self) {
        for conn in self.conns.lock().drain(..) {
            conn.kill.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn version(&self) -> u32 {
        self.state.lock().version
    }

    pub fn trusted_key(&self) -> Option<[u8; 32]> {
        self.state.lock().trusted_key
    }

    pub fn set_trusted_key(&self, key: Option<[u8; 32]>) {
        self.state.lock().trusted_key = key;
    }

    pub fn set_auth_disabled(&self, disabled: bool) {
        self.state.lock().auth_disabled = disabled;
    }

    pub fn set_repeat_nonce(&self, repeat: bool) {
        self.state.lock().repeat_nonce = repeat;
    }

    pub fn require_attestation(&self, accept: bool) {
        let mut state = self.state.lock();
        state.attestation_required = true;
        state.attestation_accept = accept;
    }

    pub fn set_session(&self, session: Option<SessionBinding>) {
        self.state.lock().session = session;
    }

    pub fn session(&self) -> Option<SessionBinding> {
        self.state.lock().session.clone()
    }

    /// The next data-channel reply repeats the previous one.
    pub fn replay_next_data(&self) {
        self.state.lock().replay_next_data = true;
    }

    pub fn data_history(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .crypto
            .as_ref()
            .map(|c| c.data_history.clone())
            .unwrap_or_default()
    }

    /// Never answer calls to `method`.
    pub fn hang(&self, method: &'static str) {
        self.state.lock().hang.push(method);
    }

    /// Answer calls to `method` again. Calls already hung stay unanswered.
    pub fn resume(&self, method: &'static str) {
        self.state.lock().hang.retain(|m| *m != method);
    }

    /// Answer the next call to `method` with `response`.
    pub fn script(&self, method: &'static str, response: Response) {
        self.state
            .lock()
            .scripted
            .entry(method)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<Request> {
        self.state.lock().calls.clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(Request::method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|r| r.method() == method)
            .count()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Push an unsolicited message to every live connection.
    pub fn push(&self, push: Push) {
        for conn in self.conns.lock().iter() {
            let _ = conn.pushes.send(Frame::Push { push: push.clone() });
        }
    }

    /// Answer one request. None means the call is never answered.
    fn handle(&self, request: Request) -> Option<Response> {
        let mut state = self.state.lock();
        state.calls.push(request.clone());
        let method = request.method();
        if state.hang.contains(&method) {
            return None;
        }
        if let Some(response) = state.scripted.get_mut(method).and_then(VecDeque::pop_front) {
            return Some(response);
        }

        let response = match request {
            Request::Connect { .. } => {
                state.connects += 1;
                Response::Connected {
                    version: state.version,
                    capabilities: state.capabilities,
                    pid: Some(COMPANION_PID),
                }
            }
            Request::GetVersion => Response::Version { version: state.version },
            Request::GetCapabilities => Response::Capabilities {
                capabilities: state.capabilities,
            },
            Request::GetChallenge => {
                if state.auth_disabled {
                    Response::Challenge { nonce: Vec::new() }
                } else {
                    let nonce = match (&state.last_nonce, state.repeat_nonce) {
                        (Some(last), true) => last.clone(),
                        _ => {
                            let mut nonce = vec![0u8; 32];
                            rand::rngs::OsRng.fill_bytes(&mut nonce);
                            nonce
                        }
                    };
                    state.last_nonce = Some(nonce.clone());
                    Response::Challenge { nonce }
                }
            }
            Request::Authenticate { signature, instance_id } => {
                let verified = match (&state.trusted_key, &state.last_nonce) {
                    (Some(key), Some(nonce)) => verify(key, nonce, &signature),
                    _ => false,
                };
                if verified {
                    state.session = Some(SessionBinding {
                        instance_id,
                        expires_in_ms: 60_000,
                    });
                }
                Response::AuthResult {
                    authenticated: verified,
                    attestation_required: verified && state.attestation_required,
                }
            }
            Request::VerifyAttestation { chain } => {
                let verified = state.attestation_accept && !chain.is_empty();
                Response::AttestationResult {
                    verified,
                    reason: (!verified).then(|| "certificate chain rejected".to_string()),
                }
            }
            Request::CheckSession { .. } => Response::SessionInfo {
                session: state.session.clone(),
            },
            Request::InitCryptoChannel { client_public } => {
                let (crypto, server_public) = ServerCrypto::derive(&client_public, 1);
                state.crypto = Some(crypto);
                Response::CryptoInit {
                    server_public,
                    session_id: "secure-1".to_string(),
                    generation: 1,
                }
            }
            Request::SendControlMessage { envelope } => match state.crypto.as_mut() {
                Some(crypto) => crypto.echo(ChannelKind::Control, &envelope),
                None => not_initialized(),
            },
            Request::SendDataMessage { envelope } => {
                let replay = std::mem::take(&mut state.replay_next_data);
                match state.crypto.as_mut() {
                    Some(crypto) if replay => match crypto.data_history.last() {
                        Some(previous) => Response::Envelope {
                            envelope: previous.clone(),
                        },
                        None => crypto.echo(ChannelKind::Data, &envelope),
                    },
                    Some(crypto) => crypto.echo(ChannelKind::Data, &envelope),
                    None => not_initialized(),
                }
            }
            Request::RotateChannelKeys { client_public, generation } => {
                let (crypto, server_public) = ServerCrypto::derive(&client_public, generation);
                state.crypto = Some(crypto);
                Response::KeysRotated {
                    server_public,
                    generation,
                }
            }
            Request::RegisterStatusCallback
            | Request::RegisterBufferReleaseCallback
            | Request::UnregisterCallbacks
            | Request::Configure { .. }
            | Request::ConfigureHotPath { .. }
            | Request::ReleaseScreenshot { .. } => Response::Ack,
            Request::GetSystemStatus => Response::SystemStatus {
                status: SystemStatus {
                    uptime_ms: 1_000,
                    buffers_outstanding: 0,
                    inference_ready: true,
                    memory_used_bytes: 64 * 1024 * 1024,
                },
            },
            Request::GetScreenshot | Request::RequestPerception { .. } => {
                let id = state.next_buffer;
                state.next_buffer += 1;
                Response::Buffer {
                    buffer: BufferDescriptor {
                        id,
                        handle: 0x1000 + id,
                        width: 1080,
                        height: 2400,
                    },
                }
            }
            Request::Ping => Response::Pong,
        };
        Some(response)
    }
}

fn not_initialized() -> Response {
    Response::Error {
        code: 409,
        message: "secure channel not initialized".into(),
    }
}

fn verify(key: &[u8; 32], nonce: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(nonce, &signature).is_ok()
}

async fn read_frame<R>(reader: &mut R) -> Option<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await.ok()?;
    let len = decode_frame_len(header).ok()?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.ok()?;
    decode_frame(&body).ok()
}

/// Connector that opens duplex connections to a [`Companion`].
pub struct FakeConnector {
    companion: Arc<Companion>,
}

impl FakeConnector {
    pub fn new(companion: Arc<Companion>) -> Arc<Self> {
        Arc::new(Self { companion })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn is_discoverable(&self) -> bool {
        self.companion.is_running()
    }

    async fn open(
        &self,
        correlator: Arc<RequestCorrelator>,
    ) -> Result<Arc<dyn IpcChannel>, ChannelFault> {
        if !self.companion.is_running() {
            return Err(ChannelFault::NotFound);
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let kill = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        self.companion.conns.lock().push(ConnHandle {
            kill: kill.clone(),
            pushes: tx.clone(),
        });

        let companion = Arc::clone(&self.companion);
        let reader_kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    () = reader_kill.cancelled() => break,
                    frame = read_frame(&mut server_r) => frame,
                };
                let Some(Frame::Call { id, request }) = frame else {
                    break;
                };
                if let Some(response) = companion.handle(request) {
                    let _ = tx.send(Frame::Reply { id, response });
                }
            }
            reader_kill.cancel();
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    () = kill.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                let Ok(bytes) = encode_frame(&frame) else { continue };
                if server_w.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let channel: Arc<dyn IpcChannel> = FramedChannel::start(client_r, client_w, correlator);
        Ok(channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMode {
    Available,
    Unavailable,
    PolicyDenied,
}

struct RunnerState {
    root: RootMode,
    installed_digest: Option<String>,
    installed_version: Option<u32>,
    /// Protocol spoken by the bundled binary once deployed.
    bundled_version: u32,
    ignore_term: bool,
    ignore_kill: bool,
    commands: Vec<String>,
}

/// Privileged shell that drives a [`Companion`].
pub struct FakeRunner {
    companion: Arc<Companion>,
    bundled_digest: String,
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn new(companion: Arc<Companion>, bundled_bytes: &[u8], bundled_version: u32) -> Arc<Self> {
        Arc::new(Self {
            companion,
            bundled_digest: hex::encode(Sha256::digest(bundled_bytes)),
            state: Mutex::new(RunnerState {
                root: RootMode::Available,
                installed_digest: None,
                installed_version: None,
                bundled_version,
                ignore_term: false,
                ignore_kill: false,
                commands: Vec::new(),
            }),
        })
    }

    pub fn set_root(&self, root: RootMode) {
        self.state.lock().root = root;
    }

    /// Pretend the bundled binary is already installed.
    pub fn mark_installed(&self, version: u32) {
        let mut state = self.state.lock();
        state.installed_digest = Some(self.bundled_digest.clone());
        state.installed_version = Some(version);
    }

    pub fn set_ignore_term(&self, ignore: bool) {
        self.state.lock().ignore_term = ignore;
    }

    /// Simulate an unkillable companion (stuck in uninterruptible sleep).
    pub fn set_ignore_kill(&self, ignore: bool) {
        self.state.lock().ignore_kill = ignore;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn run(&self, command: &str) -> CommandOutcome {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());
        if state.root != RootMode::Available {
            let reason = match state.root {
                RootMode::PolicyDenied => "avc: denied by selinux policy",
                _ => "su: permission denied",
            };
            return CommandOutcome::AccessDenied {
                reason: reason.to_string(),
            };
        }

        if command == "id -u" {
            return ok("0\n");
        }
        if command.starts_with("sha256sum ") {
            return match &state.installed_digest {
                Some(digest) => ok(&format!("{digest}  /data/adb/rootlink/rootlinkd\n")),
                None => error("No such file or directory"),
            };
        }
        if command.starts_with("cp ") {
            state.installed_digest = Some(self.bundled_digest.clone());
            state.installed_version = Some(state.bundled_version);
            return ok("");
        }
        if command.ends_with("--version") {
            return match state.installed_version {
                Some(v) => ok(&format!("rootlinkd 0.3.0 (protocol {v})\n")),
                None => error("not installed"),
            };
        }
        if command.ends_with("--daemon") {
            return match state.installed_version {
                Some(v) => {
                    self.companion.launch(v);
                    ok("")
                }
                None => error("not installed"),
            };
        }
        if command.contains("-TERM") {
            if !state.ignore_term {
                self.companion.stop();
            }
            return ok("");
        }
        if command.contains("-KILL") {
            if !state.ignore_kill {
                self.companion.stop();
            }
            return ok("");
        }
        if command.starts_with("kill -0") || command.starts_with("pgrep") {
            return if self.companion.is_running() {
                ok(&format!("{COMPANION_PID}\n"))
            } else {
                error("no process")
            };
        }
        if command.starts_with("cat ") {
            return match self.companion.trusted_key() {
                Some(key) => ok(&format!("{}\n", hex::encode(key))),
                None => error("No such file or directory"),
            };
        }
        if command.starts_with("mkdir -p") && command.contains("printf") {
            let key = command
                .split_whitespace()
                .find(|word| word.len() == 64 && word.chars().all(|c| c.is_ascii_hexdigit()))
                .and_then(|word| hex::decode(word).ok())
                .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
            return match key {
                Some(key) => {
                    self.companion.set_trusted_key(Some(key));
                    ok("")
                }
                None => error("bad key"),
            };
        }
        error(&format!("unknown command: {command}"))
    }
}

fn ok(output: &str) -> CommandOutcome {
    CommandOutcome::Success {
        exit_code: 0,
        output: output.to_string(),
    }
}

fn error(stderr: &str) -> CommandOutcome {
    CommandOutcome::Error {
        message: "exit status 1".to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl PrivilegedRunner for FakeRunner {
    async fn execute(&self, command: &str, _timeout: Duration) -> CommandOutcome {
        self.run(command)
    }
}

/// Attestation provider with a fixed answer.
pub struct FakeAttestation(pub Result<Vec<Vec<u8>>, String>);

#[async_trait]
impl AttestationProvider for FakeAttestation {
    async fn certificate_chain(&self) -> Result<Vec<Vec<u8>>, String> {
        self.0.clone()
    }
}

pub const BUNDLED_BYTES: &[u8] = b"\x7fELF rootlinkd test build";

/// Configuration with short timeouts rooted in `dir`.
pub fn test_config(dir: &Path) -> LinkConfig {
    let bundled_binary = dir.join("rootlinkd");
    std::fs::write(&bundled_binary, BUNDLED_BYTES).expect("write bundled binary");

    LinkConfig {
        socket_path: dir.join("rootlink.sock"),
        state_dir: dir.join("state"),
        bundled_binary,
        installed_binary: PathBuf::from("/data/adb/rootlink/rootlinkd"),
        su_path: PathBuf::from("su"),
        transport: TransportConfig {
            call_timeout: Duration::from_secs(2),
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                max_attempts: 3,
            },
            client_version: PROTOCOL_VERSION,
        },
        correlator: CorrelatorConfig {
            request_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(500),
            ..CorrelatorConfig::default()
        },
        lifecycle: LifecycleConfig {
            startup_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_millis(50),
            command_timeout: Duration::from_secs(1),
            ..LifecycleConfig::default()
        },
        keep_alive: None,
        pressure_interval: None,
        pool: BufferPoolConfig {
            max_buffers: 3,
            default_release_timeout: Duration::from_millis(200),
        },
        audit: AuditConfig {
            rate_limit: 1_000,
            ..AuditConfig::default()
        },
        secure_channel: SecureChannelConfig {
            rotation_threshold: 1_000,
        },
        session: SessionConfig {
            debounce: Duration::from_millis(200),
            conflict_wait: Duration::from_millis(100),
            manage_companion: true,
        },
        auth: AuthenticatorConfig::default(),
        key_paths: KeyPaths {
            public_key: PathBuf::from(KEY_PATH),
            pinned_fingerprint: PathBuf::from(PINNED_PATH),
        },
    }
}

/// A runtime wired to a scripted companion.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub companion: Arc<Companion>,
    pub runner: Arc<FakeRunner>,
    pub runtime: LinkRuntime,
}

impl Harness {
    /// Companion already installed and running at the current protocol.
    pub fn running() -> Self {
        Self::build(Companion::running(PROTOCOL_VERSION), PROTOCOL_VERSION, true, |_| {})
    }

    pub fn build(
        companion: Arc<Companion>,
        bundled_version: u32,
        installed: bool,
        tweak: impl FnOnce(&mut LinkConfig),
    ) -> Self {
        Self::build_with_attestation(
            companion,
            bundled_version,
            installed,
            tweak,
            Arc::new(FakeAttestation(Err("no attestation".into()))),
        )
    }

    pub fn build_with_attestation(
        companion: Arc<Companion>,
        bundled_version: u32,
        installed: bool,
        tweak: impl FnOnce(&mut LinkConfig),
        attestation: Arc<dyn AttestationProvider>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let runner = FakeRunner::new(Arc::clone(&companion), BUNDLED_BYTES, bundled_version);
        if installed {
            runner.mark_installed(companion.version());
        }
        let runtime = LinkRuntime::with_parts(
            config,
            FakeConnector::new(Arc::clone(&companion)),
            Arc::clone(&runner) as Arc<dyn PrivilegedRunner>,
            attestation,
        );
        Self {
            dir,
            companion,
            runner,
            runtime,
        }
    }
}

/// Wait until `predicate` holds, polling every few milliseconds.
pub async fn eventually(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Decode an envelope header without opening it.
pub fn envelope_generation(envelope: &[u8]) -> u32 {
    EnvelopeHeader::parse(envelope).expect("header").generation
}
