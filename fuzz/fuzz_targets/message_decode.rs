//! Fuzz target for Message::decode
//!
//! Arbitrary bytes must never panic the decoder, and anything it accepts
//! must survive an encode/decode cycle unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pitaya_proto::{ErrorBody, Message};

fuzz_target!(|data: &[u8]| {
    let Ok(message) = Message::decode(data) else {
        return;
    };

    let encoded = message.encode().expect("decoded message must re-encode");
    assert_eq!(Message::decode(&encoded).as_ref(), Ok(&message));

    let _ = message.error_body();
    let _ = ErrorBody::decode(data);
});
