#![no_main]
use libfuzzer_sys::fuzz_target;

use hreq_nio::http11::{try_parse_fields, try_parse_req};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((_req, size))) = try_parse_req(data) {
        assert!(size <= data.len());

        // whatever follows the head is fed as a trailer section.
        let _ = try_parse_fields(&data[size..]);
    }
});
