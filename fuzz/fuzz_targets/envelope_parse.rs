//! Fuzz target for envelope parsing
//!
//! Arbitrary socket text must only ever produce `Ok` or `Err`.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::{Envelope, Frame, Message};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(frame) = Frame::parse(text) else {
        return;
    };

    if let Ok(envelope) = Envelope::from_frame(&frame) {
        // Anything that parses must encode again
        let reencoded = envelope.to_frame(frame.seq).and_then(|f| f.to_text());
        assert!(reencoded.is_ok());
    }
    let _ = Message::from_frame(&frame);
});
