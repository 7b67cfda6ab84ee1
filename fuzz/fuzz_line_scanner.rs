//! Fuzz target for the control-stream line scanner.
//!
//! Run with: cargo +nightly fuzz run fuzz_line_scanner
//!
//! Feeds arbitrary byte chunks through `LineScanner` and hands every
//! framed line to `ReplyLine::parse`, looking for panics anywhere in
//! the framing and reply-grammar pipeline.

#![no_main]

use libfuzzer_sys::fuzz_target;
use torwatch_control::{LineScanner, ReplyLine, MAX_LINE_LEN};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    // First byte picks the chunk size, so CRLF pairs land on split
    // boundaries too.
    let step = (data[0] as usize).max(1);
    let mut scanner = LineScanner::new(MAX_LINE_LEN);
    for chunk in data[1..].chunks(step) {
        match scanner.push(chunk) {
            Ok(lines) => {
                for line in lines {
                    let _ = ReplyLine::parse(&line.bytes);
                }
            }
            Err(failure) => {
                for line in failure.completed {
                    let _ = ReplyLine::parse(&line.bytes);
                }
                return;
            }
        }
    }
    if let Some(last) = scanner.finish() {
        let _ = ReplyLine::parse(&last.bytes);
    }
});
