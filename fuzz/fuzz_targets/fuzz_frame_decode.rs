//! Fuzz target for length-prefixed JSON frame decoding.
//!
//! Arbitrary bytes from the companion socket must never panic the reader:
//! the length prefix and the body are each either accepted or rejected.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rootlink::ipc::protocol::{decode_frame, decode_frame_len, encode_frame, FRAME_HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() < FRAME_HEADER_SIZE {
        let _ = decode_frame(data);
        return;
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&data[..FRAME_HEADER_SIZE]);
    let _ = decode_frame_len(header);

    // A frame that decodes must re-encode.
    if let Ok(frame) = decode_frame(&data[FRAME_HEADER_SIZE..]) {
        assert!(encode_frame(&frame).is_ok());
    }
});
