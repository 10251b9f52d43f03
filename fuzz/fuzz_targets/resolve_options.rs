#![no_main]

use libfuzzer_sys::fuzz_target;
use pixbox::ops::TransformSpec;
use pixbox::options::{resolve, RawParams};

// Arbitrary query strings must resolve or fail cleanly, never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(query) = std::str::from_utf8(data) else {
        return;
    };
    let raw = RawParams::from_query(query);
    if let Ok(spec) = resolve(&raw, &TransformSpec::default()) {
        assert!((1..=100).contains(&spec.quality));
        assert!(spec.degrees < 360);
    }
});
