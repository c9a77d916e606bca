//! Authenticated envelope format for secure-channel messages.
//!
//! ```text
//! [RLSC][version:1][kind:1][direction:1][generation:4][sequence:8][nonce:12][ciphertext+tag]
//! ```
//!
//! Integers are little-endian. The whole header, nonce included, is the
//! AEAD associated data, so generation and sequence cannot be altered
//! without failing authentication.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const ENVELOPE_MAGIC: &[u8; 4] = b"RLSC";
pub const ENVELOPE_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Header bytes preceding the ciphertext.
pub const ENVELOPE_HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 4 + 8 + NONCE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelKind {
    Control = 1,
    Data = 2,
}

impl ChannelKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Control),
            2 => Some(Self::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl Direction {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::ClientToServer),
            1 => Some(Self::ServerToClient),
            _ => None,
        }
    }
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub kind: ChannelKind,
    pub direction: Direction,
    pub generation: u32,
    pub sequence: u64,
}

impl EnvelopeHeader {
    /// Parse the header without decrypting. Used to reject stale
    /// generations before touching the cipher.
    pub fn parse(envelope: &[u8]) -> Result<Self, CryptoError> {
        if envelope.len() < ENVELOPE_HEADER_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptFailed("envelope too short".into()));
        }
        if &envelope[..4] != ENVELOPE_MAGIC {
            return Err(CryptoError::DecryptFailed("bad magic".into()));
        }
        if envelope[4] != ENVELOPE_VERSION {
            return Err(CryptoError::DecryptFailed(format!(
                "unsupported envelope version: {}",
                envelope[4]
            )));
        }
        let kind = ChannelKind::from_byte(envelope[5])
            .ok_or_else(|| CryptoError::DecryptFailed("unknown channel kind".into()))?;
        let direction = Direction::from_byte(envelope[6])
            .ok_or_else(|| CryptoError::DecryptFailed("unknown direction".into()))?;

        let mut generation = [0u8; 4];
        generation.copy_from_slice(&envelope[7..11]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&envelope[11..19]);

        Ok(Self {
            kind,
            direction,
            generation: u32::from_le_bytes(generation),
            sequence: u64::from_le_bytes(sequence),
        })
    }
}

/// AES-256-GCM cipher for one channel and key generation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelCipher {
    key: [u8; 32],
    #[zeroize(skip)]
    kind: ChannelKind,
}

impl ChannelCipher {
    pub fn new(key: [u8; 32], kind: ChannelKind) -> Self {
        Self { key, kind }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(
        &self,
        direction: Direction,
        generation: u32,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + plaintext.len() + TAG_SIZE);
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.push(self.kind as u8);
        out.push(direction as u8);
        out.extend_from_slice(&generation.to_le_bytes());
        out.extend_from_slice(&sequence.to_le_bytes());
        out.extend_from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &out,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Authenticate and decrypt an envelope for this channel.
    pub fn open(&self, envelope: &[u8]) -> Result<(EnvelopeHeader, Vec<u8>), CryptoError> {
        let header = EnvelopeHeader::parse(envelope)?;
        if header.kind != self.kind {
            return Err(CryptoError::DecryptFailed(format!(
                "envelope for {:?} channel opened on {:?}",
                header.kind, self.kind
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptFailed(e.to_string()))?;
        let (aad, ciphertext) = envelope.split_at(ENVELOPE_HEADER_SIZE);
        let nonce = Nonce::from_slice(&aad[ENVELOPE_HEADER_SIZE - NONCE_SIZE..]);

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptFailed("authentication failed".into()))?;
        Ok((header, plaintext))
    }
}

impl std::fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCipher")
            .field("key", &"[REDACTED]")
            .field("kind", &self.kind)
            .finish()
    }
}
