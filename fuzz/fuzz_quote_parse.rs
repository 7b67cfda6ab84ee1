//! Fuzz target for torrc escaping and control-reply quote parsing.
//!
//! Run with: cargo +nightly fuzz run fuzz_quote_parse
//!
//! Exercises `escape_value`, `parse_quoted`, and `parse_key_value` with
//! arbitrary input. The escaper must always produce US-ASCII, and the
//! parsers must fail cleanly instead of panicking or losing ground.

#![no_main]

use libfuzzer_sys::fuzz_target;
use torwatch_control::{escape_value, parse_key_value, parse_quoted};

fuzz_target!(|data: &[u8]| {
    let escaped = escape_value(data);
    assert!(escaped.is_ascii());

    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let _ = parse_quoted(s, 0, s.len());

    // Walk key=value pairs the way the event parsers do; every Ok must
    // make progress.
    let mut at = 0;
    while at < s.len() {
        match parse_key_value(s, at, s.len()) {
            Ok(kv) => {
                assert!(kv.next > at && kv.next <= s.len());
                at = kv.next;
            }
            Err(_) => break,
        }
    }
});
