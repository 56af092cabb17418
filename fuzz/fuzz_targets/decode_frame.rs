#![no_main]

use libfuzzer_sys::fuzz_target;
use ltx_wire::Cursor;

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };

    // No byte sequence may panic the decoders: every outcome must be a
    // value, an incomplete marker, or a protocol error.
    let mut cur = Cursor::new(data);
    loop {
        let before = cur.consumed();
        if let Ok(Some(_)) = cur.array_len() {
            continue;
        }
        if let Ok(Some(_)) = cur.uint() {
            continue;
        }
        if cur.opt_nil() == Some(true) {
            continue;
        }
        if let Ok(Some(_)) = cur.str_bytes() {
            continue;
        }
        if let Ok(Some(_)) = cur.bin_len() {
            continue;
        }
        if cur.consumed() == before {
            break;
        }
    }
});
