//! Fuzz target for secure channel envelope parsing and authentication.
//!
//! Forged or truncated envelopes must be rejected without panicking, and
//! nothing that was not sealed under the channel key may ever open.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rootlink::crypto::{ChannelCipher, ChannelKind, EnvelopeHeader};

fuzz_target!(|data: &[u8]| {
    let _ = EnvelopeHeader::parse(data);

    let cipher = ChannelCipher::new([7u8; 32], ChannelKind::Data);
    assert!(cipher.open(data).is_err());
});
