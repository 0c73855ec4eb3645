#![no_main]

use libfuzzer_sys::fuzz_target;
use w64fsd::path::normalize;

/// `spec.md` §8: normalization never panics, and is idempotent wherever it
/// succeeds - `normalize(normalize(x)) == normalize(x)`.
fuzz_target!(|raw: &str| {
    const MAX_PATH: usize = 255;
    const MAX_NAME: usize = 64;

    let Ok(once) = normalize(raw, MAX_PATH, MAX_NAME, false) else {
        return;
    };
    let twice = normalize(once.as_str(), MAX_PATH, MAX_NAME, false)
        .expect("a path we just normalized must normalize again");
    assert_eq!(once.as_str(), twice.as_str());
});
