#![no_main]
use libfuzzer_sys::fuzz_target;

use hreq_nio::chunked::{ChunkedDecoder, Decoded};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // first byte picks how much the consumer accepts per call.
    let max = data[0] as usize + 1;
    let data = &data[1..];

    let mut dec = ChunkedDecoder::new();
    let mut pos = 0;

    loop {
        match dec.decode(&data[pos..], max) {
            Ok(Decoded::Data { consumed, data: range }) => {
                assert!(range.end - range.start <= max);
                assert!(consumed > 0);
                pos += consumed;
            }
            Ok(Decoded::NeedMore { consumed }) => {
                pos += consumed;
                if consumed == 0 {
                    break;
                }
            }
            Ok(Decoded::End { .. }) => break,
            Err(_) => break,
        }
        assert!(pos <= data.len());
    }
});
