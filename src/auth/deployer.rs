//! Provisioning of the client public key to the companion.
//!
//! The companion trusts the hex-encoded public key at a root-owned path and
//! pins the fingerprint it first saw. Deploying a new key removes the pinned
//! fingerprint first so the companion accepts the replacement.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::keys::{constant_time_eq, fingerprint_of, KeyStore};
use crate::audit::{AuditEventType, AuditLog};
use crate::error::{AuthError, Result};
use crate::lifecycle::{shell_quote, CommandOutcome, PrivilegedRunner};
use crate::observe::StateStream;

/// Fingerprint characters written to audit details.
const FINGERPRINT_PREFIX: usize = 16;

/// Companion-side key locations.
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub public_key: PathBuf,
    pub pinned_fingerprint: PathBuf,
}

impl Default for KeyPaths {
    fn default() -> Self {
        Self {
            public_key: PathBuf::from("/data/adb/rootlink/client.pub"),
            pinned_fingerprint: PathBuf::from("/data/adb/rootlink/pinned.fp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDeploymentState {
    NotDeployed,
    Deployed { fingerprint: String },
    Mismatch { local: String, remote: String },
    Failed(String),
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(FINGERPRINT_PREFIX)]
}

pub struct KeyDeployer {
    runner: Arc<dyn PrivilegedRunner>,
    paths: KeyPaths,
    command_timeout: Duration,
    audit: Arc<AuditLog>,
    state: StateStream<KeyDeploymentState>,
    lock: tokio::sync::Mutex<()>,
}

impl KeyDeployer {
    pub fn new(
        runner: Arc<dyn PrivilegedRunner>,
        paths: KeyPaths,
        command_timeout: Duration,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            runner,
            paths,
            command_timeout,
            audit,
            state: StateStream::new(KeyDeploymentState::NotDeployed),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> KeyDeploymentState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<KeyDeploymentState> {
        self.state.subscribe()
    }

    /// Compare the companion's trusted key with `local_fingerprint`.
    pub async fn check(&self, local_fingerprint: &str) -> Result<KeyDeploymentState> {
        let command = format!("cat {}", shell_quote(&self.paths.public_key.to_string_lossy()));
        let state = match self.runner.execute(&command, self.command_timeout).await {
            CommandOutcome::Success { output, .. } => match hex::decode(output.trim()) {
                Ok(remote_key) => {
                    let remote = fingerprint_of(&remote_key);
                    if constant_time_eq(remote.as_bytes(), local_fingerprint.as_bytes()) {
                        KeyDeploymentState::Deployed { fingerprint: remote }
                    } else {
                        KeyDeploymentState::Mismatch {
                            local: local_fingerprint.to_string(),
                            remote,
                        }
                    }
                }
                Err(_) => KeyDeploymentState::Mismatch {
                    local: local_fingerprint.to_string(),
                    remote: "unreadable".to_string(),
                },
            },
            CommandOutcome::Error { .. } => KeyDeploymentState::NotDeployed,
            CommandOutcome::AccessDenied { reason } => {
                return Err(AuthError::KeyDeploymentFailed(reason).into());
            }
            CommandOutcome::Timeout => {
                return Err(AuthError::KeyDeploymentFailed("key check timed out".into()).into());
            }
        };
        self.state.set(state.clone());
        Ok(state)
    }

    /// Make sure the companion trusts the key in `keys`. Returns the deployed
    /// fingerprint.
    pub async fn ensure_deployed(&self, keys: &KeyStore) -> Result<String> {
        let _guard = self.lock.lock().await;
        let public_key = keys.public_key()?;
        let local = fingerprint_of(&public_key);

        match self.check(&local).await {
            Ok(KeyDeploymentState::Deployed { fingerprint }) => return Ok(fingerprint),
            Ok(KeyDeploymentState::Mismatch { remote, .. }) => {
                tracing::info!(
                    local = short(&local),
                    remote = short(&remote),
                    "companion trusts a different key"
                );
            }
            Ok(_) => tracing::info!("client key not yet deployed"),
            Err(e) => return Err(self.failed(e.to_string())),
        }

        self.deploy(&public_key, &local).await?;
        Ok(local)
    }

    async fn deploy(&self, public_key: &[u8; 32], local: &str) -> Result<()> {
        let key_path = shell_quote(&self.paths.public_key.to_string_lossy());
        let pinned = shell_quote(&self.paths.pinned_fingerprint.to_string_lossy());
        let dir = self
            .paths
            .public_key
            .parent()
            .map(|p| shell_quote(&p.to_string_lossy()))
            .unwrap_or_else(|| "'.'".to_string());
        let command = format!(
            "mkdir -p {dir} && rm -f {pinned} && printf '%s\\n' {key} > {key_path} \
             && chmod 600 {key_path} && chown root:root {key_path}",
            key = hex::encode(public_key),
        );

        match self.runner.execute(&command, self.command_timeout).await {
            CommandOutcome::Success { .. } => {}
            CommandOutcome::Error { message, stderr } => {
                return Err(self.failed(format!("{message}: {}", stderr.trim())));
            }
            CommandOutcome::AccessDenied { reason } => return Err(self.failed(reason)),
            CommandOutcome::Timeout => return Err(self.failed("key deployment timed out".into())),
        }

        match self.check(local).await {
            Ok(KeyDeploymentState::Deployed { .. }) => {
                self.audit
                    .log(AuditEventType::KeyDeployed, format!("fingerprint={}", short(local)));
                tracing::info!(fingerprint = short(local), "client key deployed");
                Ok(())
            }
            Ok(other) => Err(self.failed(format!("verification after deploy: {other:?}"))),
            Err(e) => Err(self.failed(e.to_string())),
        }
    }

    fn failed(&self, reason: String) -> crate::error::LinkError {
        tracing::warn!(%reason, "client key deployment failed");
        self.audit.log(AuditEventType::KeyDeploymentFailed, &reason);
        self.state.set(KeyDeploymentState::Failed(reason.clone()));
        AuthError::KeyDeploymentFailed(reason).into()
    }
}
