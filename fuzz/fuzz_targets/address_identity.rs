#![no_main]

use embellish_core::host::identity_from_address;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(address) = std::str::from_utf8(data) else {
        return;
    };

    for param in ["id", "serverId", "x"] {
        if let Some(identity) = identity_from_address(address, param) {
            assert!(!identity.is_empty());
        }
    }
});
