//! Wire format for the companion session protocol.
//!
//! # Security
//! - Frame size limits prevent memory exhaustion from a misbehaving peer
//! - Protocol versioning lets the client refuse a stale companion binary
//!
//! Frames are JSON documents preceded by a 4-byte little-endian length.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Remote error codes with transport meaning.
pub mod remote_codes {
    pub const UNAUTHORIZED: i32 = 401;
    pub const SESSION_EXPIRED: i32 = 419;
    pub const RESOURCE_EXHAUSTED: i32 = 429;
    pub const UNSUPPORTED: i32 = 501;
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Call identifier, unique per process.
pub type CallId = u64;

/// Capability bit-set advertised by the companion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const SCREENSHOT: Capabilities = Capabilities(1 << 0);
    pub const PERCEPTION: Capabilities = Capabilities(1 << 1);
    pub const INPUT_INJECTION: Capabilities = Capabilities(1 << 2);
    pub const SECURE_CHANNEL: Capabilities = Capabilities(1 << 3);
    pub const ATTESTATION: Capabilities = Capabilities(1 << 4);
    pub const HOT_PATH: Capabilities = Capabilities(1 << 5);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Session currently bound on the companion side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub instance_id: String,
    pub expires_in_ms: u64,
}

/// Shared buffer handed out by the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub id: u64,
    pub handle: u64,
    pub width: u32,
    pub height: u32,
}

/// Companion health summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub uptime_ms: u64,
    pub buffers_outstanding: u32,
    pub inference_ready: bool,
    pub memory_used_bytes: u64,
}

/// Status push from the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: String,
    pub detail: Option<String>,
}

/// Client-to-companion calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Connect { client_version: u32 },
    GetVersion,
    GetCapabilities,
    GetChallenge,
    Authenticate { signature: Vec<u8>, instance_id: String },
    VerifyAttestation { chain: Vec<Vec<u8>> },
    CheckSession { instance_id: String },
    InitCryptoChannel { client_public: [u8; 32] },
    SendControlMessage { envelope: Vec<u8> },
    SendDataMessage { envelope: Vec<u8> },
    RotateChannelKeys { client_public: [u8; 32], generation: u32 },
    RegisterStatusCallback,
    RegisterBufferReleaseCallback,
    UnregisterCallbacks,
    Configure { config: serde_json::Value },
    ConfigureHotPath { rules: serde_json::Value },
    GetSystemStatus,
    GetScreenshot,
    RequestPerception { params: serde_json::Value },
    ReleaseScreenshot { buffer_id: u64 },
    Ping,
}

impl Request {
    /// Method name used in logs and metrics labels.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::GetVersion => "get_version",
            Self::GetCapabilities => "get_capabilities",
            Self::GetChallenge => "get_challenge",
            Self::Authenticate { .. } => "authenticate",
            Self::VerifyAttestation { .. } => "verify_attestation",
            Self::CheckSession { .. } => "check_session",
            Self::InitCryptoChannel { .. } => "init_crypto_channel",
            Self::SendControlMessage { .. } => "send_control_message",
            Self::SendDataMessage { .. } => "send_data_message",
            Self::RotateChannelKeys { .. } => "rotate_channel_keys",
            Self::RegisterStatusCallback => "register_status_callback",
            Self::RegisterBufferReleaseCallback => "register_buffer_release_callback",
            Self::UnregisterCallbacks => "unregister_callbacks",
            Self::Configure { .. } => "configure",
            Self::ConfigureHotPath { .. } => "configure_hot_path",
            Self::GetSystemStatus => "get_system_status",
            Self::GetScreenshot => "get_screenshot",
            Self::RequestPerception { .. } => "request_perception",
            Self::ReleaseScreenshot { .. } => "release_screenshot",
            Self::Ping => "ping",
        }
    }
}

/// Companion-to-client replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Connected { version: u32, capabilities: Capabilities, pid: Option<u32> },
    Version { version: u32 },
    Capabilities { capabilities: Capabilities },
    Challenge { nonce: Vec<u8> },
    AuthResult { authenticated: bool, attestation_required: bool },
    AttestationResult { verified: bool, reason: Option<String> },
    SessionInfo { session: Option<SessionBinding> },
    CryptoInit { server_public: [u8; 32], session_id: String, generation: u32 },
    Envelope { envelope: Vec<u8> },
    KeysRotated { server_public: [u8; 32], generation: u32 },
    SystemStatus { status: SystemStatus },
    Buffer { buffer: BufferDescriptor },
    Ack,
    Pong,
    Error { code: i32, message: String },
}

/// Unsolicited companion-to-client messages (callback channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum Push {
    Status { update: StatusUpdate },
    BufferReleaseRequest { buffer_id: u64, timeout_ms: u64 },
}

/// Top-level wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Call { id: CallId, request: Request },
    Reply { id: CallId, response: Response },
    Push { push: Push },
}

/// Encode a frame, length prefix included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse and validate a length prefix.
pub fn decode_frame_len(header: [u8; FRAME_HEADER_SIZE]) -> Result<usize, ProtocolError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::InvalidFormat("empty frame".into()));
    }
    Ok(len)
}

/// Decode a frame body (without the length prefix).
pub fn decode_frame(body: &[u8]) -> Result<Frame, ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_slice(body)?)
}
