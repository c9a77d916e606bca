//! Secure dual-channel session.
//!
//! Every operation holds one async mutex for its full duration, including
//! the IPC round-trip, so encrypt, decrypt and rotation never interleave.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::envelope::{ChannelCipher, ChannelKind, Direction, EnvelopeHeader};
use super::kdf::{derive_channel_keys, derive_channel_secret};
use crate::audit::{AuditEventType, AuditLog};
use crate::error::{CryptoError, LinkError, Result};
use crate::ipc::{Request, Response, RpcExecutor};
use crate::observe::StateStream;

/// Secure channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureChannelState {
    Disconnected,
    Handshaking,
    Connected { session_id: String, generation: u32 },
    Error(String),
}

/// Identity of an established channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSession {
    pub session_id: String,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub struct SecureChannelConfig {
    /// Data messages per key generation before an automatic rotation.
    pub rotation_threshold: u64,
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self {
            rotation_threshold: 1000,
        }
    }
}

/// Per-direction sequence counters for one channel.
#[derive(Default)]
struct Counters {
    sent: u64,
    accepted: u64,
}

struct ActiveChannel {
    session_id: String,
    generation: u32,
    psk: Zeroizing<Vec<u8>>,
    control: ChannelCipher,
    data: ChannelCipher,
    control_seq: Counters,
    data_seq: Counters,
    data_usage: u64,
}

impl ActiveChannel {
    fn parts(&mut self, kind: ChannelKind) -> (&ChannelCipher, &mut Counters) {
        match kind {
            ChannelKind::Control => (&self.control, &mut self.control_seq),
            ChannelKind::Data => (&self.data, &mut self.data_seq),
        }
    }

    fn seal_outbound(&mut self, kind: ChannelKind, plaintext: &[u8]) -> Result<Vec<u8>> {
        let generation = self.generation;
        let (cipher, counters) = self.parts(kind);
        let sequence = counters.sent + 1;
        let envelope = cipher.seal(Direction::ClientToServer, generation, sequence, plaintext)?;
        counters.sent = sequence;
        Ok(envelope)
    }

    /// Check generation and sequence, then decrypt.
    fn open_inbound(
        &mut self,
        kind: ChannelKind,
        envelope: &[u8],
    ) -> std::result::Result<Vec<u8>, CryptoError> {
        let header = EnvelopeHeader::parse(envelope)?;
        if header.generation < self.generation {
            return Err(CryptoError::StaleGeneration {
                received: header.generation,
                current: self.generation,
            });
        }
        if header.generation > self.generation {
            return Err(CryptoError::DecryptFailed(format!(
                "envelope from future generation {}",
                header.generation
            )));
        }
        if header.direction != Direction::ServerToClient {
            return Err(CryptoError::DecryptFailed("reflected envelope".into()));
        }

        let (cipher, counters) = self.parts(kind);
        if header.sequence <= counters.accepted {
            return Err(CryptoError::Replay {
                received: header.sequence,
                last_accepted: counters.accepted,
            });
        }
        let (_, plaintext) = cipher.open(envelope)?;
        counters.accepted = header.sequence;
        Ok(plaintext)
    }
}

/// Ephemeral key pair for one handshake.
fn ephemeral() -> (StaticSecret, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// Derive both channel ciphers from a completed exchange.
fn derive_ciphers(
    psk: &[u8],
    secret: &StaticSecret,
    client_public: &[u8; 32],
    server_public: &[u8; 32],
    generation: u32,
) -> std::result::Result<(ChannelCipher, ChannelCipher), CryptoError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*server_public));
    if !shared.was_contributory() {
        return Err(CryptoError::HandshakeFailed("non-contributory peer key".into()));
    }
    let channel_secret = derive_channel_secret(psk, client_public, server_public)?;
    let keys = derive_channel_keys(&channel_secret, shared.as_bytes(), generation)?;
    Ok((
        ChannelCipher::new(keys.control, ChannelKind::Control),
        ChannelCipher::new(keys.data, ChannelKind::Data),
    ))
}

/// Connection errors pass through untouched so the reconnect wrapper still
/// sees PeerDied; anything else becomes `wrap(msg)`.
fn crypto_failure(error: LinkError, wrap: fn(String) -> CryptoError) -> LinkError {
    match error {
        LinkError::Connection(_) | LinkError::Closed => error,
        other => wrap(other.to_string()).into(),
    }
}

pub struct SecureChannel {
    executor: Arc<dyn RpcExecutor>,
    audit: Arc<AuditLog>,
    config: SecureChannelConfig,
    inner: Mutex<Option<ActiveChannel>>,
    state: StateStream<SecureChannelState>,
}

impl SecureChannel {
    pub fn new(
        executor: Arc<dyn RpcExecutor>,
        audit: Arc<AuditLog>,
        config: SecureChannelConfig,
    ) -> Self {
        Self {
            executor,
            audit,
            config,
            inner: Mutex::new(None),
            state: StateStream::new(SecureChannelState::Disconnected),
        }
    }

    /// Run the key-agreement handshake and initialize both channels.
    pub async fn establish(&self, psk: &[u8]) -> Result<ChannelSession> {
        let mut inner = self.inner.lock().await;
        // Drop any previous keys before handshaking again.
        *inner = None;
        self.state.set(SecureChannelState::Handshaking);

        match self.handshake(psk).await {
            Ok(active) => {
                let session = ChannelSession {
                    session_id: active.session_id.clone(),
                    generation: active.generation,
                };
                *inner = Some(active);
                self.state.set(SecureChannelState::Connected {
                    session_id: session.session_id.clone(),
                    generation: session.generation,
                });
                self.audit.log(
                    AuditEventType::ChannelEstablished,
                    format!("session={} generation={}", session.session_id, session.generation),
                );
                tracing::info!(session_id = %session.session_id, "secure channel established");
                Ok(session)
            }
            Err(e) => {
                self.state.set(SecureChannelState::Error(e.to_string()));
                tracing::warn!(error = %e, "secure channel handshake failed");
                Err(e)
            }
        }
    }

    async fn handshake(&self, psk: &[u8]) -> Result<ActiveChannel> {
        let (secret, client_public) = ephemeral();
        let response = self
            .executor
            .execute(Request::InitCryptoChannel { client_public })
            .await
            .map_err(|e| crypto_failure(e, CryptoError::HandshakeFailed))?;

        let Response::CryptoInit {
            server_public,
            session_id,
            generation,
        } = response
        else {
            return Err(
                CryptoError::HandshakeFailed(format!("unexpected reply: {response:?}")).into(),
            );
        };

        let (control, data) =
            derive_ciphers(psk, &secret, &client_public, &server_public, generation)?;
        Ok(ActiveChannel {
            session_id,
            generation,
            psk: Zeroizing::new(psk.to_vec()),
            control,
            data,
            control_seq: Counters::default(),
            data_seq: Counters::default(),
            data_usage: 0,
        })
    }

    /// Encrypt, send over the control channel, and decrypt the reply.
    pub async fn send_control(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let active = inner.as_mut().ok_or(CryptoError::NotInitialized)?;
        self.exchange(active, ChannelKind::Control, plaintext).await
    }

    /// Encrypt, send over the data channel, and decrypt the reply. Rotates
    /// keys once the usage threshold is reached.
    pub async fn send_data(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let active = inner.as_mut().ok_or(CryptoError::NotInitialized)?;
        let reply = self.exchange(active, ChannelKind::Data, plaintext).await?;

        active.data_usage += 1;
        if active.data_usage >= self.config.rotation_threshold {
            tracing::debug!(usage = active.data_usage, "data channel usage threshold reached");
            if let Err(e) = self.rotate_locked(active).await {
                // The reply is valid; rotation is retried on the next send.
                tracing::warn!(error = %e, "automatic key rotation failed");
            }
        }
        Ok(reply)
    }

    async fn exchange(
        &self,
        active: &mut ActiveChannel,
        kind: ChannelKind,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let envelope = active.seal_outbound(kind, plaintext)?;
        let request = match kind {
            ChannelKind::Control => Request::SendControlMessage { envelope },
            ChannelKind::Data => Request::SendDataMessage { envelope },
        };
        match self.executor.execute(request).await? {
            Response::Envelope { envelope } => self.open_checked(active, kind, &envelope),
            other => Err(LinkError::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    fn open_checked(
        &self,
        active: &mut ActiveChannel,
        kind: ChannelKind,
        envelope: &[u8],
    ) -> Result<Vec<u8>> {
        match active.open_inbound(kind, envelope) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                let event = match e {
                    CryptoError::Replay { .. } | CryptoError::StaleGeneration { .. } => {
                        AuditEventType::ReplayRejected
                    }
                    _ => AuditEventType::DecryptFailed,
                };
                self.audit.log(event, format!("{kind:?} channel: {e}"));
                Err(e.into())
            }
        }
    }

    /// Decrypt an envelope that arrived outside a reply, such as a pushed
    /// data frame.
    pub async fn open_inbound(&self, kind: ChannelKind, envelope: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let active = inner.as_mut().ok_or(CryptoError::NotInitialized)?;
        self.open_checked(active, kind, envelope)
    }

    /// Ask the companion for a new key generation and swap keys.
    pub async fn rotate_keys(&self) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let active = inner.as_mut().ok_or(CryptoError::NotInitialized)?;
        self.rotate_locked(active).await
    }

    async fn rotate_locked(&self, active: &mut ActiveChannel) -> Result<u32> {
        let next = active
            .generation
            .checked_add(1)
            .ok_or_else(|| CryptoError::KeyRotationFailed("generation space exhausted".into()))?;
        let (secret, client_public) = ephemeral();

        let response = self
            .executor
            .execute(Request::RotateChannelKeys {
                client_public,
                generation: next,
            })
            .await
            .map_err(|e| crypto_failure(e, CryptoError::KeyRotationFailed))?;

        let Response::KeysRotated {
            server_public,
            generation,
        } = response
        else {
            return Err(
                CryptoError::KeyRotationFailed(format!("unexpected reply: {response:?}")).into(),
            );
        };
        if generation != next {
            return Err(CryptoError::KeyRotationFailed(format!(
                "companion answered generation {generation}, expected {next}"
            ))
            .into());
        }

        let (control, data) =
            derive_ciphers(&active.psk, &secret, &client_public, &server_public, next)
                .map_err(|e| CryptoError::KeyRotationFailed(e.to_string()))?;

        // Old ciphers are zeroized as they drop here.
        active.control = control;
        active.data = data;
        active.generation = next;
        active.control_seq = Counters::default();
        active.data_seq = Counters::default();
        active.data_usage = 0;

        self.state.set(SecureChannelState::Connected {
            session_id: active.session_id.clone(),
            generation: next,
        });
        self.audit
            .log(AuditEventType::KeysRotated, format!("generation={next}"));
        tracing::info!(generation = next, "channel keys rotated");
        Ok(next)
    }

    /// Drop all key material and return to Disconnected.
    pub async fn reset(&self) {
        self.inner.lock().await.take();
        self.state.set(SecureChannelState::Disconnected);
    }

    pub fn state(&self) -> SecureChannelState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SecureChannelState> {
        self.state.subscribe()
    }
}
