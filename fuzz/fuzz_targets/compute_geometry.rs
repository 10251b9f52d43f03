#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pixbox::engine::{compute_geometry, MAX_DIMENSION};
use pixbox::ops::{Anchor, Mode, Rect, TransformSpec};

#[derive(Arbitrary, Debug)]
struct Input {
    source_w: u32,
    source_h: u32,
    width: Option<u32>,
    height: Option<u32>,
    mode: u8,
    anchor_x: u8,
    anchor_y: u8,
    degrees: u16,
    expand: bool,
    rect: (u32, u32, u32, u32),
}

fuzz_target!(|input: Input| {
    let spec = TransformSpec {
        mode: Mode::ALL[input.mode as usize % Mode::ALL.len()],
        width: input.width,
        height: input.height,
        position: Anchor::new(input.anchor_x as f64 / 255.0, input.anchor_y as f64 / 255.0),
        degrees: input.degrees as u32 % 360,
        expand: input.expand,
        rect: Some(Rect::new(input.rect.0, input.rect.1, input.rect.2, input.rect.3)),
        ..TransformSpec::default()
    };

    if let Ok(g) = compute_geometry(input.source_w, input.source_h, &spec) {
        assert!(g.width >= 1 && g.height >= 1);
        assert!(g.width <= MAX_DIMENSION && g.height <= MAX_DIMENSION);
        if let Some(crop) = g.crop {
            assert!(crop.right() <= input.source_w as u64);
            assert!(crop.bottom() <= input.source_h as u64);
        }
        if let (Mode::Crop | Mode::Fill | Mode::Scale, Some(w), Some(h)) =
            (spec.mode, spec.width, spec.height)
        {
            assert_eq!((g.width, g.height), (w, h));
        }
    }
});
