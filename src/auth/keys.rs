//! Client identity: Ed25519 signing key and instance identifier.
//!
//! SECURITY: the private key is read into zeroizing buffers and written with
//! mode 0600 inside a 0700 directory. It never leaves this module; callers
//! only see the public key, its fingerprint, and signatures.

use std::io;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{AuthError, LinkError, Result};

const KEY_FILE: &str = "client_ed25519.key";
const INSTANCE_FILE: &str = "instance_id";

/// SHA-256 fingerprint of a public key, lowercase hex.
pub fn fingerprint_of(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Constant-time equality for fingerprints and digests.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Persistent client identity under a state directory.
pub struct KeyStore {
    dir: PathBuf,
    signing: Mutex<Option<SigningKey>>,
    instance_id: Mutex<Option<String>>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("loaded", &self.signing.lock().is_some())
            .finish()
    }
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            signing: Mutex::new(None),
            instance_id: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Load the signing key from disk.
    pub async fn load(&self) -> Result<()> {
        let path = self.key_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AuthError::KeyNotFound(path.display().to_string()).into());
            }
            Err(e) => {
                return Err(AuthError::KeyCorrupted(format!("{}: {e}", path.display())).into())
            }
        };

        let seed: Zeroizing<[u8; 32]> = match bytes.as_slice().try_into() {
            Ok(seed) => Zeroizing::new(seed),
            Err(_) => {
                return Err(AuthError::KeyCorrupted(format!(
                    "{}: expected 32 bytes, found {}",
                    path.display(),
                    bytes.len()
                ))
                .into());
            }
        };
        *self.signing.lock() = Some(SigningKey::from_bytes(&seed));
        Ok(())
    }

    /// Load the key pair, generating and persisting one if none exists.
    /// Returns true when a new key was generated.
    pub async fn ensure_key_pair(&self) -> Result<bool> {
        if self.signing.lock().is_some() {
            return Ok(false);
        }
        match self.load().await {
            Ok(()) => Ok(false),
            Err(LinkError::Auth(AuthError::KeyNotFound(_))) => {
                let key = SigningKey::generate(&mut rand::rngs::OsRng);
                let seed = Zeroizing::new(key.to_bytes());
                self.write_private(&self.key_path(), seed.as_slice()).await?;
                tracing::info!(path = %self.key_path().display(), "generated client key pair");
                *self.signing.lock() = Some(key);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_private(&self, path: &Path, contents: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;

        // An existing file keeps its old mode on open.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    pub fn public_key(&self) -> Result<[u8; 32]> {
        self.signing
            .lock()
            .as_ref()
            .map(|key| key.verifying_key().to_bytes())
            .ok_or_else(|| AuthError::KeyNotFound("client key not loaded".into()).into())
    }

    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint_of(&self.public_key()?))
    }

    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        self.signing
            .lock()
            .as_ref()
            .map(|key| key.sign(message).to_bytes())
            .ok_or_else(|| AuthError::KeyNotFound("client key not loaded".into()).into())
    }

    /// Stable client instance identifier, created on first use.
    pub async fn instance_id(&self) -> Result<String> {
        if let Some(id) = self.instance_id.lock().clone() {
            return Ok(id);
        }

        let path = self.dir.join(INSTANCE_FILE);
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => Uuid::parse_str(text.trim()).ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let id = match existing {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                self.write_private(&path, id.as_bytes()).await?;
                tracing::debug!(instance_id = %id, "created client instance id");
                id
            }
        };
        *self.instance_id.lock() = Some(id.clone());
        Ok(id)
    }
}
