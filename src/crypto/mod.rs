//! Encrypted dual-channel session with the companion.
//!
//! An X25519 handshake bound to a pre-shared secret yields independent
//! AES-256-GCM keys for the control and data channels. All key material
//! implements `Zeroize` and is wiped when dropped.

mod envelope;
mod kdf;
mod secure_channel;

pub use envelope::{
    ChannelCipher, ChannelKind, Direction, EnvelopeHeader, ENVELOPE_HEADER_SIZE, ENVELOPE_MAGIC,
    ENVELOPE_VERSION,
};
pub use kdf::{derive_channel_keys, derive_channel_secret, ChannelKeys, CHANNEL_CONTEXT};
pub use secure_channel::{ChannelSession, SecureChannel, SecureChannelConfig, SecureChannelState};
