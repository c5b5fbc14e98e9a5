//! Fuzz target for address parsing
//!
//! Covers the `[type, id, requestId?]` wire form and the JSON shorthands.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::Address;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    if let Ok(address) = serde_json::from_value::<Address>(value.clone()) {
        let wire = serde_json::to_value(address).unwrap();
        assert_eq!(serde_json::from_value::<Address>(wire).unwrap(), address);
    }
    let _ = Address::from_shorthand_json(&value);
});
