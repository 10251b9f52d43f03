#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pixbox::engine::execute;
use pixbox::ops::{Mode, TransformSpec};

// Untrusted origin bytes through the full transform path.
fuzz_target!(|data: &[u8]| {
    let spec = TransformSpec {
        mode: Mode::Clip,
        width: Some(32),
        height: Some(32),
        ..TransformSpec::default()
    };
    let _ = execute(Bytes::copy_from_slice(data), &spec);
});
