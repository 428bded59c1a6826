//! Any frame that decodes must re-encode to the same bytes.
//!
//! PSBT-carrying messages are excluded: the PSBT container preserves
//! unknown key-value pairs whose encoding is not canonical.

#![no_main]

use libfuzzer_sys::fuzz_target;

use gyre_core::wire::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = Message::from_frame_body(data) {
        if matches!(msg, Message::UnsignedPsbt(_) | Message::SignedPsbt(_)) {
            return;
        }
        let frame = msg.to_frame().expect("decoded message must encode");
        assert_eq!(&frame[2..], data);
    }
});
