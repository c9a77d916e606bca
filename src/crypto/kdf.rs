//! Key derivation for the secure channel.
//!
//! ```text
//! secret  = HMAC-SHA256(psk, client_public || server_public || CONTEXT)
//! control = HMAC-SHA256(secret, x25519_shared || "control" || generation_le)
//! data    = HMAC-SHA256(secret, x25519_shared || "data"    || generation_le)
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Fixed context string bound into the channel secret.
pub const CHANNEL_CONTEXT: &[u8] = b"rootlink-secure-channel-v1";

const CONTROL_LABEL: &[u8] = b"control";
const DATA_LABEL: &[u8] = b"data";

/// Per-channel keys for one key generation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelKeys {
    pub control: [u8; 32],
    pub data: [u8; 32],
}

impl std::fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKeys")
            .field("control", &"[REDACTED]")
            .field("data", &"[REDACTED]")
            .finish()
    }
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InitFailed(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Derive the channel secret from the pre-shared secret and both ephemeral
/// public values.
pub fn derive_channel_secret(
    psk: &[u8],
    client_public: &[u8; 32],
    server_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if psk.is_empty() {
        return Err(CryptoError::InitFailed("empty pre-shared secret".into()));
    }
    hmac(psk, &[client_public, server_public, CHANNEL_CONTEXT])
}

/// Derive independent control and data keys for `generation`.
pub fn derive_channel_keys(
    secret: &[u8; 32],
    shared: &[u8; 32],
    generation: u32,
) -> Result<ChannelKeys, CryptoError> {
    let generation = generation.to_le_bytes();
    let control = hmac(secret, &[shared, CONTROL_LABEL, &generation])?;
    let data = hmac(secret, &[shared, DATA_LABEL, &generation])?;
    Ok(ChannelKeys {
        control: *control,
        data: *data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_never_share_keys() {
        let secret = derive_channel_secret(b"psk", &[1; 32], &[2; 32]).unwrap();
        let keys = derive_channel_keys(&secret, &[3; 32], 0).unwrap();
        assert_ne!(keys.control, keys.data);
    }

    #[test]
    fn test_generation_changes_keys() {
        let secret = derive_channel_secret(b"psk", &[1; 32], &[2; 32]).unwrap();
        let g0 = derive_channel_keys(&secret, &[3; 32], 0).unwrap();
        let g1 = derive_channel_keys(&secret, &[3; 32], 1).unwrap();
        assert_ne!(g0.control, g1.control);
        assert_ne!(g0.data, g1.data);
    }

    #[test]
    fn test_secret_binds_public_order() {
        let a = derive_channel_secret(b"psk", &[1; 32], &[2; 32]).unwrap();
        let b = derive_channel_secret(b"psk", &[2; 32], &[1; 32]).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_empty_psk_rejected() {
        assert!(matches!(
            derive_channel_secret(b"", &[1; 32], &[2; 32]),
            Err(CryptoError::InitFailed(_))
        ));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let secret = derive_channel_secret(b"psk", &[1; 32], &[2; 32]).unwrap();
        let keys = derive_channel_keys(&secret, &[3; 32], 0).unwrap();
        assert!(format!("{keys:?}").contains("REDACTED"));
    }
}
