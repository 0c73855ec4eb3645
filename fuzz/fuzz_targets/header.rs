#![no_main]

use libfuzzer_sys::fuzz_target;
use w64fsd::wire::header;

/// `spec.md` §8: framing never panics on arbitrary bytes, and a header that
/// parses successfully round-trips through `build_response` without losing
/// the payload it carried.
fuzz_target!(|data: &[u8]| {
    let max_payload: u16 = 4096;
    let Ok(req) = header::parse(data, max_payload) else {
        return;
    };
    let echoed = header::build_response(req.opcode, w64fsd::status::Status::Ok, req.payload);
    let reparsed = header::parse(&echoed, u16::MAX).expect("a header we just built must parse");
    assert_eq!(reparsed.opcode, req.opcode);
    assert_eq!(reparsed.payload, req.payload);
});
