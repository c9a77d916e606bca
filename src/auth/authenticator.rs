//! Challenge-response authentication against the companion.
//!
//! SECURITY: the client signs only fresh challenges. Digests of signed
//! challenges are remembered for `replay_window` and a repeated challenge is
//! refused and audited. Attestation chains are forwarded, never verified
//! locally; the companion is the sole verifier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::deployer::KeyDeployer;
use super::keys::KeyStore;
use crate::audit::{AuditEventType, AuditLog};
use crate::error::{AuthError, LinkError, Result};
use crate::ipc::{Request, Response, RpcExecutor};

/// Source of the hardware-backed attestation certificate chain.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    async fn certificate_chain(&self) -> std::result::Result<Vec<Vec<u8>>, String>;
}

/// Provider for devices without attestation support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAttestation;

#[async_trait]
impl AttestationProvider for NoAttestation {
    async fn certificate_chain(&self) -> std::result::Result<Vec<Vec<u8>>, String> {
        Err("no attestation provider configured".into())
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    /// How long a signed challenge digest is remembered.
    pub replay_window: Duration,
    pub cleanup_interval: Duration,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            replay_window: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The companion issued an empty challenge.
    Disabled,
    Authenticated { attested: bool },
}

pub struct Authenticator {
    executor: Arc<dyn RpcExecutor>,
    keys: Arc<KeyStore>,
    deployer: Arc<KeyDeployer>,
    attestation: Arc<dyn AttestationProvider>,
    audit: Arc<AuditLog>,
    config: AuthenticatorConfig,
    signed: DashMap<[u8; 32], Instant>,
    prepared: Mutex<Option<String>>,
}

impl Authenticator {
    pub fn new(
        executor: Arc<dyn RpcExecutor>,
        keys: Arc<KeyStore>,
        deployer: Arc<KeyDeployer>,
        attestation: Arc<dyn AttestationProvider>,
        audit: Arc<AuditLog>,
        config: AuthenticatorConfig,
    ) -> Self {
        Self {
            executor,
            keys,
            deployer,
            attestation,
            audit,
            config,
            signed: DashMap::new(),
            prepared: Mutex::new(None),
        }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Ensure a local key pair exists and the companion trusts it. Returns
    /// the key fingerprint. Cached until a signature is rejected.
    pub async fn prepare_credentials(&self) -> Result<String> {
        if let Some(fingerprint) = self.prepared.lock().clone() {
            return Ok(fingerprint);
        }

        if let Err(e) = self.keys.ensure_key_pair().await {
            self.audit.log(AuditEventType::KeyNotFound, e.to_string());
            return Err(e);
        }
        let fingerprint = self.deployer.ensure_deployed(&self.keys).await?;
        *self.prepared.lock() = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    /// Forget cached credential state so the next attempt re-verifies the
    /// deployed key.
    pub fn invalidate(&self) {
        self.prepared.lock().take();
    }

    /// Run the full handshake: credentials, challenge, signature, and
    /// attestation when the companion asks for it.
    pub async fn authenticate(&self) -> Result<AuthOutcome> {
        self.prepare_credentials().await?;
        let instance_id = self.keys.instance_id().await?;

        let nonce = match self.executor.execute(Request::GetChallenge).await {
            Ok(Response::Challenge { nonce }) => nonce,
            Ok(other) => {
                return Err(self.reject(
                    AuditEventType::ChallengeFailed,
                    AuthError::ChallengeFailed(format!("unexpected reply {other:?}")).into(),
                ));
            }
            Err(e @ LinkError::Connection(_)) => {
                self.audit.log(AuditEventType::ChallengeFailed, e.to_string());
                return Err(e);
            }
            Err(e) => {
                return Err(self.reject(
                    AuditEventType::ChallengeFailed,
                    AuthError::ChallengeFailed(e.to_string()).into(),
                ));
            }
        };

        if nonce.is_empty() {
            tracing::info!("companion has authentication disabled");
            self.audit.log(AuditEventType::AuthSuccess, "authentication disabled by companion");
            self.audit
                .log(AuditEventType::SessionCreated, format!("instance_id={instance_id}"));
            return Ok(AuthOutcome::Disabled);
        }

        let digest: [u8; 32] = Sha256::digest(&nonce).into();
        if self.is_replayed(&digest) {
            self.audit
                .log(AuditEventType::ReplayRejected, "companion reissued a signed challenge");
            return Err(self.reject(
                AuditEventType::ChallengeFailed,
                AuthError::ChallengeFailed("challenge was already signed".into()).into(),
            ));
        }
        self.signed.insert(digest, Instant::now());

        let signature = self.keys.sign(&nonce)?;
        let attestation_required = match self
            .executor
            .execute(Request::Authenticate {
                signature: signature.to_vec(),
                instance_id: instance_id.clone(),
            })
            .await
        {
            Ok(Response::AuthResult {
                authenticated: true,
                attestation_required,
            }) => attestation_required,
            Ok(Response::AuthResult { .. }) | Err(LinkError::Unauthorized(_)) => {
                self.invalidate();
                return Err(self.reject(
                    AuditEventType::SignatureInvalid,
                    AuthError::SignatureInvalid.into(),
                ));
            }
            Ok(other) => {
                return Err(self.reject(
                    AuditEventType::AuthFailure,
                    LinkError::Protocol(format!("unexpected authenticate reply {other:?}")),
                ));
            }
            Err(e) => return Err(self.reject(AuditEventType::AuthFailure, e)),
        };

        if attestation_required {
            self.attest().await?;
        }

        self.audit.log(
            AuditEventType::AuthSuccess,
            format!("instance_id={instance_id} attested={attestation_required}"),
        );
        self.audit
            .log(AuditEventType::SessionCreated, format!("instance_id={instance_id}"));
        tracing::info!(attested = attestation_required, "authenticated with companion");
        Ok(AuthOutcome::Authenticated {
            attested: attestation_required,
        })
    }

    async fn attest(&self) -> Result<()> {
        let chain = match self.attestation.certificate_chain().await {
            Ok(chain) if !chain.is_empty() => chain,
            Ok(_) => {
                return Err(self.reject(
                    AuditEventType::AttestationFailed,
                    AuthError::AttestationFailed("empty certificate chain".into()).into(),
                ));
            }
            Err(reason) => {
                return Err(self.reject(
                    AuditEventType::AttestationFailed,
                    AuthError::AttestationFailed(reason).into(),
                ));
            }
        };

        match self.executor.execute(Request::VerifyAttestation { chain }).await {
            Ok(Response::AttestationResult { verified: true, .. }) => Ok(()),
            Ok(Response::AttestationResult { reason, .. }) => Err(self.reject(
                AuditEventType::AttestationFailed,
                AuthError::AttestationMismatch(
                    reason.unwrap_or_else(|| "rejected by companion".into()),
                )
                .into(),
            )),
            Ok(other) => Err(self.reject(
                AuditEventType::AttestationFailed,
                LinkError::Protocol(format!("unexpected attestation reply {other:?}")),
            )),
            Err(e) => Err(self.reject(AuditEventType::AttestationFailed, e)),
        }
    }

    fn reject(&self, event: AuditEventType, error: LinkError) -> LinkError {
        tracing::warn!(%event, error = %error, "authentication step failed");
        self.audit.log(event, error.to_string());
        error
    }

    fn is_replayed(&self, digest: &[u8; 32]) -> bool {
        self.signed
            .get(digest)
            .is_some_and(|signed_at| signed_at.elapsed() <= self.config.replay_window)
    }

    /// Drop challenge digests older than the replay window.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.signed.len();
        let window = self.config.replay_window;
        self.signed.retain(|_, signed_at| signed_at.elapsed() <= window);
        before - self.signed.len().min(before)
    }

    pub fn remembered_challenges(&self) -> usize {
        self.signed.len()
    }

    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(this) = this.upgrade() else { break };
                        let removed = this.cleanup_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "expired signed challenge digests");
                        }
                    }
                }
            }
        })
    }
}
