//! Frame decoding must never panic on untrusted bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;

use gyre_core::wire::Message;

fuzz_target!(|data: &[u8]| {
    let _ = Message::from_frame_body(data);
});
