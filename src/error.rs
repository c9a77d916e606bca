//! Error taxonomy for the rootlink client runtime.
//!
//! Every failure surfaced to a caller is a [`LinkError`]. The nested enums
//! mirror the failure families of the session protocol: connection,
//! authentication, crypto, deployment, and security. Each error carries a
//! stable numeric code and a recoverability flag that feed
//! [`crate::session::SessionState::Error`].

use std::time::Duration;
use thiserror::Error;

/// Transport and connection-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Companion service not found")]
    ServiceNotFound,

    #[error("Companion process died")]
    PeerDied,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IPC channel resources exhausted")]
    ResourceExhausted,

    #[error("Reconnection exhausted after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("Permission denied by companion transport")]
    PermissionDenied,

    #[error("Not connected")]
    NotConnected,

    #[error("Unclassified transport failure: {0}")]
    Unknown(String),
}

/// Authentication handshake failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Challenge fetch failed: {0}")]
    ChallengeFailed(String),

    #[error("Signature rejected by companion")]
    SignatureInvalid,

    #[error("Client key not found: {0}")]
    KeyNotFound(String),

    #[error("Client key corrupted: {0}")]
    KeyCorrupted(String),

    #[error("Key deployment failed: {0}")]
    KeyDeploymentFailed(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Session held by another client: {holder}")]
    SessionConflict { holder: String },

    #[error("Attestation failed: {0}")]
    AttestationFailed(String),

    #[error("Attestation mismatch: {0}")]
    AttestationMismatch(String),
}

/// Secure channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Channel initialization failed: {0}")]
    InitFailed(String),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Key rotation failed: {0}")]
    KeyRotationFailed(String),

    #[error("Secure channel not initialized")]
    NotInitialized,

    #[error("Message under superseded key generation {received} (current {current})")]
    StaleGeneration { received: u32, current: u32 },

    #[error("Replayed message: sequence {received} <= {last_accepted}")]
    Replay { received: u64, last_accepted: u64 },
}

/// Companion process deployment and startup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("Root access unavailable: {0}")]
    RootUnavailable(String),

    #[error("Companion binary missing: {0}")]
    BinaryMissing(String),

    #[error("Permission error: {0}")]
    PermissionError(String),

    #[error("Denied by security policy: {0}")]
    PolicyDenied(String),

    #[error("Companion process crashed: {0}")]
    ProcessCrashed(String),

    #[error("Companion did not become reachable within {0:?}")]
    StartupTimeout(Duration),

    #[error("Protocol version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Companion survived the stop request: {0}")]
    StopFailed(String),
}

/// Umbrella error for every rootlink operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Companion error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Runtime closed")]
    Closed,
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl LinkError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Connection(e) => match e {
                ConnectionError::ServiceNotFound => 100,
                ConnectionError::PeerDied => 101,
                ConnectionError::Timeout(_) => 102,
                ConnectionError::ResourceExhausted => 103,
                ConnectionError::ReconnectionExhausted { .. } => 104,
                ConnectionError::PermissionDenied => 105,
                ConnectionError::NotConnected => 106,
                ConnectionError::Unknown(_) => 199,
            },
            Self::Auth(e) => match e {
                AuthError::ChallengeFailed(_) => 200,
                AuthError::SignatureInvalid => 201,
                AuthError::KeyNotFound(_) => 202,
                AuthError::KeyCorrupted(_) => 203,
                AuthError::KeyDeploymentFailed(_) => 204,
                AuthError::SessionExpired => 205,
                AuthError::SessionConflict { .. } => 206,
                AuthError::AttestationFailed(_) => 207,
                AuthError::AttestationMismatch(_) => 208,
            },
            Self::Crypto(e) => match e {
                CryptoError::HandshakeFailed(_) => 300,
                CryptoError::InitFailed(_) => 301,
                CryptoError::EncryptFailed => 302,
                CryptoError::DecryptFailed(_) => 303,
                CryptoError::KeyRotationFailed(_) => 304,
                CryptoError::NotInitialized => 305,
                CryptoError::StaleGeneration { .. } => 306,
                CryptoError::Replay { .. } => 307,
            },
            Self::Deployment(e) => match e {
                DeploymentError::RootUnavailable(_) => 400,
                DeploymentError::BinaryMissing(_) => 401,
                DeploymentError::PermissionError(_) => 402,
                DeploymentError::PolicyDenied(_) => 403,
                DeploymentError::ProcessCrashed(_) => 404,
                DeploymentError::StartupTimeout(_) => 405,
                DeploymentError::VersionMismatch { .. } => 406,
                DeploymentError::StopFailed(_) => 407,
            },
            Self::Unauthorized(_) => 500,
            Self::Protocol(_) => 900,
            Self::Remote { .. } => 901,
            Self::Config(_) => 902,
            Self::Io(_) => 903,
            Self::Cancelled => 904,
            Self::Closed => 905,
        }
    }

    /// Whether retrying the same operation later can succeed without the
    /// caller changing anything.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::ReconnectionExhausted { .. }) => false,
            Self::Connection(_) => true,
            Self::Auth(AuthError::SessionConflict { .. } | AuthError::SessionExpired) => true,
            Self::Auth(AuthError::ChallengeFailed(_)) => true,
            Self::Auth(_) => false,
            Self::Crypto(_) => true,
            Self::Deployment(
                DeploymentError::StartupTimeout(_) | DeploymentError::ProcessCrashed(_),
            ) => true,
            Self::Deployment(_) => false,
            Self::Unauthorized(_) => false,
            Self::Config(_) | Self::Closed => false,
            Self::Protocol(_) | Self::Remote { .. } | Self::Io(_) | Self::Cancelled => true,
        }
    }

    /// Whether this failure must be written to the audit trail.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Unauthorized(_))
            || matches!(
                self,
                Self::Crypto(CryptoError::Replay { .. } | CryptoError::StaleGeneration { .. })
            )
    }

    /// Shorthand for matching the PeerDied classification.
    pub fn is_peer_died(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::PeerDied))
    }

    /// Transient transport failures eligible for a single local retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::Timeout(_) | ConnectionError::ResourceExhausted)
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
